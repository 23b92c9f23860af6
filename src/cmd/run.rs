//! Epic and chain execution: `epicflow run` and `epicflow chain`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;

use super::super::Cli;

use epicflow::agent::CommandAgent;
use epicflow::config::Config;
use epicflow::epic::Epic;
use epicflow::errors::{ConfigurationError, is_configuration_error};
use epicflow::orchestrator::shutdown;
use epicflow::orchestrator::{
    AcceptanceMode, AgentRunner, Backoff, ChainExecutor, ChainOptions, CheckpointStore,
    EpicExecutor, EpicOutcome, EpicRunOptions, GuidanceLoader, HaltReason, JsonReportSink,
    PromptFactory, PromptLimits,
};
use epicflow::report::{FailureReport, print_chain_summary, print_epic_summary};
use epicflow::tracker::{Workspace, open_workspace};

/// Resolve configuration through every layer and check it before any agent call.
fn load_config(cli: &Cli, project_dir: &Path) -> Result<Config> {
    let mut config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    if let Some(secs) = cli.timeout {
        config.flow.agent.timeout_secs = secs;
    }
    for warning in &config.env_warnings {
        tracing::warn!("{}", warning);
    }

    let problems = config.flow.validate();
    if !problems.is_empty() {
        return Err(ConfigurationError::InvalidConfig(problems.join("; ")).into());
    }
    config.ensure_directories()?;
    Ok(config)
}

/// Shared collaborators for one command invocation.
struct Engine {
    config: Config,
    runner: AgentRunner,
    workspace: Box<dyn Workspace>,
    prompts: PromptFactory,
    signals: tokio::task::JoinHandle<()>,
}

impl Engine {
    fn build(cli: &Cli, config: Config) -> Self {
        let agent = CommandAgent::new(
            &config.flow.agent.command,
            config.flow.agent_args(),
            &config.project_dir,
        );
        tracing::debug!(agent = %agent.command_line(), "agent configured");

        let (trigger, shutdown) = shutdown::channel();
        let signals = trigger.listen_for_signals();

        let runner = AgentRunner::new(
            Arc::new(agent),
            config.flow.agent_timeout(),
            Backoff::from(config.flow.retry),
            &config.log_dir.join("transcripts"),
        )
        .with_shutdown(shutdown);
        let workspace = open_workspace(&config.project_dir, !cli.no_git);
        let prompts = PromptFactory::new(
            PromptLimits::from(&config.flow.agent),
            GuidanceLoader::new(&config.epicflow_dir),
            &config.project_name(),
        );

        Self {
            config,
            runner,
            workspace,
            prompts,
            signals,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.signals.abort();
    }
}

fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn epic_exit_code(outcome: EpicOutcome) -> u8 {
    match outcome {
        EpicOutcome::Success => 0,
        EpicOutcome::StoriesBlocked => exit_code(HaltReason::StoriesBlocked.exit_code()),
        EpicOutcome::GateFailed => exit_code(HaltReason::GateFailed.exit_code()),
        EpicOutcome::Interrupted => exit_code(HaltReason::Interrupted.exit_code()),
    }
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    epic_id: u32,
    start_from: Option<usize>,
    no_resume: bool,
) -> Result<u8> {
    let config = load_config(cli, project_dir)?;
    let epic = Epic::load(&config.stories_dir, epic_id)?;
    let engine = Engine::build(cli, config);

    println!(
        "{} epic {} ({} stories, workspace: {})",
        style("Running").bold().cyan(),
        epic.id,
        epic.len(),
        engine.workspace.kind()
    );

    let executor = EpicExecutor::new(
        &engine.config,
        &engine.runner,
        engine.workspace.as_ref(),
        &engine.prompts,
    );
    let options = EpicRunOptions {
        start_from,
        no_resume,
        acceptance: None,
    };

    let report = match executor.run(&epic, &options).await {
        Ok(report) => report,
        Err(e) => {
            if !is_configuration_error(&e) {
                let store = CheckpointStore::new(
                    engine.config.checkpoint_path(epic_id),
                    engine.config.flow.checkpoint.max_age_hours,
                );
                FailureReport::from_error(epic_id, &e, &store).print();
            }
            return Err(e);
        }
    };

    print_epic_summary(&report);
    if let Some(failure) = FailureReport::from_epic(&report) {
        failure.print();
    }
    Ok(epic_exit_code(report.outcome))
}

pub async fn cmd_chain(
    cli: &Cli,
    project_dir: &Path,
    epic_ids: &[u32],
    acceptance: AcceptanceMode,
    no_block: bool,
) -> Result<u8> {
    let config = load_config(cli, project_dir)?;
    // Every epic must resolve before the first agent call.
    let epics = epic_ids
        .iter()
        .map(|id| Epic::load(&config.stories_dir, *id))
        .collect::<Result<Vec<_>, _>>()?;
    let engine = Engine::build(cli, config);

    println!(
        "{} {} epics (acceptance: {:?}, blocking: {})",
        style("Chaining").bold().cyan(),
        epics.len(),
        acceptance,
        !no_block
    );

    let sink = JsonReportSink::new(&engine.config.reports_dir);
    let executor = ChainExecutor::new(
        &engine.config,
        &engine.runner,
        engine.workspace.as_ref(),
        &engine.prompts,
        &sink,
    );
    let options = ChainOptions {
        acceptance,
        blocking: !no_block,
    };
    let report = executor.run(&epics, options).await?;

    let report_path = sink.path_for(&report.run_id);
    print_chain_summary(&report, report_path.exists().then_some(report_path.as_path()));

    if let Some(halt) = report.halted {
        if let Some(failure) = halt.gate_failure() {
            eprintln!("{} {}", style("error:").red().bold(), failure);
        }
        if let Some(last) = report.epics.last()
            && let Some(failure) = FailureReport::from_epic(last)
        {
            failure.print();
        }
    }
    Ok(exit_code(report.exit_code()))
}
