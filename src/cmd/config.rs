//! Configuration view and validation commands (`conveyor config`).

use anyhow::Result;
use std::path::Path;

use conveyor::config::Config;
use conveyor::conveyor_config::{CONFIG_FILE_NAME, ConveyorToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let conveyor_dir = project_dir.join(".conveyor");
    let config_path = conveyor_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conveyor Configuration");
            println!("======================");
            println!();

            let file = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ConveyorToml::load(&config_path)?
            } else {
                println!("No conveyor.toml found at {}", config_path.display());
                println!("Using default configuration.");
                ConveyorToml::default()
            };
            println!();
            print!("{}", toml::to_string_pretty(&file)?);
            println!();

            let config = Config::new(project_dir.to_path_buf(), false)?;
            println!("Effective values (with env overrides):");
            println!("  agent_cmd = \"{}\"", config.agent_cmd);
            println!("  external_tools = {}", config.external_tools);
            println!("  workspace_root = \"{}\"", config.workspace_root.display());
            println!();
            if !config_path.exists() {
                println!("Run 'conveyor config init' to create a conveyor.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conveyor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ConveyorToml::load(&config_path)?;
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
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conveyor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&conveyor_dir)?;
            ConveyorToml::default().save(&config_path)?;

            println!("Created conveyor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [resources] pool_size, base_port, isolation");
            println!("  - [tools] build, lint, test commands");
            println!("  - [tracker] kind, repository");
            println!();
        }
    }

    Ok(())
}
