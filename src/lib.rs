//! taskfleet - fault-tolerant distribution of chunked work across worker processes.
//!
//! Tasks are published once per run to a shared queue (Redis Streams or
//! RabbitMQ) and consumed by any number of workers. Workers that crash leave
//! their tasks recoverable: stream consumers reclaim idle deliveries, the
//! broker requeues on disconnect.

pub mod config;
pub mod models;
pub mod queue;
pub mod worker;
