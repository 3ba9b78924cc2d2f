//! Configuration view and validation commands: `bskit config`.

use anyhow::{Context, Result};
use std::path::Path;

use bskit::config::BskitToml;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("bskit Configuration");
            println!("===================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                BskitToml::load(config_path)?
            } else {
                println!("No bskit.toml found at {}", config_path.display());
                println!("Using default configuration.");
                BskitToml::default()
            };
            println!();

            let rendered =
                toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            println!("Effective values (with env overrides):");
            println!("  builder program = \"{}\"", toml.builder_program());
            println!();

            if !config_path.exists() {
                println!("Run 'bskit config init' to create a bskit.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No bskit.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = BskitToml::load(config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("bskit.toml already exists at {}", config_path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }

            BskitToml::default().save(config_path)?;

            println!("Created bskit.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [builder] program, args, image_name, env");
            println!("  - [completion] success_patterns, failure_patterns");
            println!("  - [session] timeout_secs, exit_grace_ms");
            println!();
        }
    }

    Ok(())
}
