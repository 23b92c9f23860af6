//! Configuration view and validation commands: `epicflow config`.

use anyhow::Result;
use console::style;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use epicflow::config::{Config, EPICFLOW_DIR};
    use epicflow::errors::ConfigurationError;
    use epicflow::flow_config::{CONFIG_FILE, FlowToml};
    use epicflow::orchestrator::prompts::GUIDANCE_DIR;

    let epicflow_dir = project_dir.join(EPICFLOW_DIR);
    let config_path = epicflow_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Epicflow Configuration").bold());
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No epicflow.toml found at {}", config_path.display());
                println!("Using defaults. Run 'epicflow config init' to create one.");
            }
            println!();

            // Effective values, including environment overrides.
            let config = Config::new(project_dir.to_path_buf(), false)?;
            let flow = &config.flow;
            let rendered = toml::to_string_pretty(flow)?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
            println!("Effective values:");
            println!("  project name = \"{}\"", config.project_name());
            println!("  stories dir  = {}", config.stories_dir.display());
            println!("  agent        = {} {}", flow.agent.command, flow.agent_args().join(" "));
            for warning in &config.env_warnings {
                println!("  {} {}", style("!").yellow(), warning);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No epicflow.toml found. Using defaults (valid).");
                println!();
                return Ok(());
            }

            let toml = FlowToml::load(&config_path)?;
            let problems = toml.validate();

            if problems.is_empty() {
                println!("Configuration is valid.");
                println!();
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                println!();
                return Err(ConfigurationError::InvalidConfig(format!(
                    "{} problem(s) in {}",
                    problems.len(),
                    config_path.display()
                ))
                .into());
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("epicflow.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(epicflow_dir.join(GUIDANCE_DIR))?;
            FlowToml::default().save(&config_path)?;

            println!("Created epicflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [project] name, stories_dir");
            println!("  - [agent] command, args, timeout_secs");
            println!("  - [gates] thresholds");
            println!("  - [phases.<phase>] fix-loop overrides");
            println!("  - .epicflow/guidance/<phase>.md for per-phase prompt guidance");
            println!();
        }
    }

    Ok(())
}
