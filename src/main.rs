use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use epicflow::errors::is_configuration_error;
use epicflow::logging::{LogOptions, init_logging};
use epicflow::orchestrator::AcceptanceMode;
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

/// Exit code for missing or invalid inputs.
const EXIT_CONFIGURATION: u8 = 3;

#[derive(Parser)]
#[command(name = "epicflow")]
#[command(version, about = "Drive stories and epics through agent phases and quality gates")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Do not stage or commit through git
    #[arg(long, global = true)]
    pub no_git: bool,

    /// Agent timeout in seconds. Overrides epicflow.toml and EPICFLOW_TIMEOUT_SECS.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every story of an epic, then the epic phases
    Run {
        epic: u32,

        /// Start at this story number (1-based), ignoring any checkpoint
        #[arg(long)]
        start_from: Option<usize>,

        /// Ignore the checkpoint and start from the first story
        #[arg(long)]
        no_resume: bool,
    },
    /// Run several epics in order with an acceptance gate between them
    Chain {
        #[arg(required = true, num_args = 1..)]
        epics: Vec<u32>,

        #[arg(long, value_enum, default_value = "full")]
        acceptance: AcceptanceMode,

        /// Log gate failures and keep going
        #[arg(long)]
        no_block: bool,
    },
    /// Show checkpoint, metrics and story status for an epic
    Status { epic: u32 },
    /// List epics found in the stories directory
    List,
    /// Remove an epic's checkpoint, metrics and story records
    Reset {
        epic: u32,

        /// Actually delete; without this only the files are listed
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any problems
    Validate,
    /// Initialize a default epicflow.toml file
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            if is_configuration_error(&e) {
                ExitCode::from(EXIT_CONFIGURATION)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: &Cli) -> Result<u8> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Only runs write a log file; inspection commands log to stderr alone.
    let log_dir = match &cli.command {
        Commands::Run { .. } | Commands::Chain { .. } if project_dir.is_dir() => Some(
            project_dir
                .join(epicflow::config::EPICFLOW_DIR)
                .join("logs"),
        ),
        _ => None,
    };
    let _log_guard = init_logging(LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        log_dir: log_dir.as_deref(),
    });

    match &cli.command {
        Commands::Run {
            epic,
            start_from,
            no_resume,
        } => cmd::cmd_run(cli, &project_dir, *epic, *start_from, *no_resume).await,
        Commands::Chain {
            epics,
            acceptance,
            no_block,
        } => cmd::cmd_chain(cli, &project_dir, epics, *acceptance, *no_block).await,
        Commands::Status { epic } => cmd::cmd_status(&project_dir, *epic).map(|_| 0),
        Commands::List => cmd::cmd_list(&project_dir).map(|_| 0),
        Commands::Reset { epic, force } => cmd::cmd_reset(&project_dir, *epic, *force).map(|_| 0),
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone()).map(|_| 0),
    }
}
