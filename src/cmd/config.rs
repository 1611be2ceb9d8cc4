//! `sweteam config`: configuration view and validation commands.

use anyhow::{Context, Result, bail};
use std::path::Path;

use sweteam::config::{CONFIG_DIR, CliOverrides, Config, SweteamToml, config_path};

use super::super::ConfigCommands;

pub fn cmd_config(workspace: &Path, overrides: &CliOverrides, command: Option<ConfigCommands>) -> Result<()> {
    let path = config_path(workspace);
    let lookup = |key: &str| std::env::var(key).ok();

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = Config::resolve(workspace, lookup, overrides).context("Invalid configuration")?;
            if path.exists() {
                println!("# Config file: {}", path.display());
            } else {
                println!("# No sweteam.toml at {}; showing defaults", path.display());
            }
            println!("# Effective values, including environment and CLI overrides");
            println!();
            print!("{}", config.settings.to_toml_string()?);
        }
        Some(ConfigCommands::Validate) => {
            let config = match Config::resolve(workspace, lookup, overrides) {
                Ok(config) => config,
                Err(e) => bail!("Configuration is invalid: {}", e),
            };
            if config.warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &config.warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if path.exists() {
                println!("sweteam.toml already exists at {}", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            let dir = workspace.join(CONFIG_DIR);
            std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            std::fs::write(&path, SweteamToml::default().to_toml_string()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Created sweteam.toml at {}", path.display());
        }
    }

    Ok(())
}
