//! Configuration display command.

use std::path::Path;

use console::style;

use taskfleet::config::Settings;

/// Print resolved settings (defaults, file, environment, flags) as TOML.
pub fn cmd_config_show(settings: &Settings, source: Option<&Path>) -> anyhow::Result<()> {
    match source {
        Some(path) => eprintln!("{} Config file: {}", style("→").dim(), path.display()),
        None => eprintln!("{} No config file found, using defaults", style("→").dim()),
    }
    if let Err(e) = settings.validate() {
        eprintln!("{} {}", style("!").yellow(), e);
    }

    print!("{}", toml::to_string_pretty(settings)?);
    Ok(())
}
