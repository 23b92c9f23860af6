//! Inspection and cleanup: `epicflow status`, `epicflow list`, `epicflow reset`.

use anyhow::{Context, Result};
use chrono::Utc;
use console::style;
use std::path::{Path, PathBuf};

use epicflow::config::Config;
use epicflow::epic::Epic;
use epicflow::orchestrator::lock::EpicLock;
use epicflow::orchestrator::{CheckpointStore, EpicMetrics};
use epicflow::story::{StoryRecord, discover_epics};

fn checkpoint_store(config: &Config, epic: u32) -> CheckpointStore {
    CheckpointStore::new(
        config.checkpoint_path(epic),
        config.flow.checkpoint.max_age_hours,
    )
}

pub fn cmd_list(project_dir: &Path) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let epics = discover_epics(&config.stories_dir)?;

    println!();
    if epics.is_empty() {
        println!(
            "No stories found in {}",
            config.relative(&config.stories_dir).display()
        );
        println!();
        return Ok(());
    }

    println!("{:<6} {:<8} Progress", "Epic", "Stories");
    println!("{:<6} {:<8} --------", "----", "-------");
    for (epic, count) in epics {
        let progress = match checkpoint_store(&config, epic).load() {
            Ok(Some(cp)) => format!(
                "{}/{} done, {} blocked, {} skipped ({})",
                cp.completed, count, cp.failed, cp.skipped, cp.reason
            ),
            Ok(None) => style("not started").dim().to_string(),
            Err(_) => style("unreadable checkpoint").red().to_string(),
        };
        println!("{:<6} {:<8} {}", epic, count, progress);
    }
    println!();
    Ok(())
}

pub fn cmd_status(project_dir: &Path, epic_id: u32) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let epic = Epic::load(&config.stories_dir, epic_id)?;
    let store = checkpoint_store(&config, epic_id);
    let now = Utc::now();

    println!();
    println!("{}", style(format!("Epic {}", epic.id)).bold().cyan());

    match store.load()? {
        Some(cp) => {
            let fresh = store.load_fresh(epic_id, now).is_some();
            println!(
                "  Checkpoint: {} at {} ({}{})",
                cp.reason,
                cp.timestamp.format("%Y-%m-%d %H:%M:%S"),
                if fresh { "resumes at story #" } else { "stale, story #" },
                cp.next_index() + 1
            );
            println!(
                "  Counts:     {} done, {} blocked, {} skipped",
                cp.completed, cp.failed, cp.skipped
            );
        }
        None => println!("  Checkpoint: {}", style("none").dim()),
    }

    if let Some(metrics) = EpicMetrics::load(&config.metrics_path(epic_id))? {
        let verdicts: Vec<String> = metrics
            .verdict_counts()
            .iter()
            .map(|(verdict, n)| format!("{} {}", n, verdict))
            .collect();
        println!(
            "  Last run:   {} ({})",
            metrics.run_id,
            metrics.outcome.as_deref().unwrap_or("in progress")
        );
        if !verdicts.is_empty() {
            println!("  Gates:      {}", verdicts.join(", "));
        }
        if !metrics.prompt_truncations.is_empty() {
            println!(
                "  {} {} prompt fragments were truncated or dropped",
                style("!").yellow(),
                metrics.prompt_truncations.len()
            );
        }
    }

    println!();
    println!("  {:<4} {:<8} {:<12} {:<10} {:<6} Title", "#", "Story", "Status", "Verdict", "Fixes");
    for (i, story) in epic.stories.iter().enumerate() {
        let record = StoryRecord::load(&config.story_record_path(&story.id.to_string()))
            .ok()
            .flatten();
        let (status, verdict, fixes) = match &record {
            Some(r) => (
                r.status.to_string(),
                r.last_verdict()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".into()),
                r.total_fix_attempts().to_string(),
            ),
            None => ("-".into(), "-".into(), "-".into()),
        };
        println!(
            "  {:<4} {:<8} {:<12} {:<10} {:<6} {}",
            i + 1,
            story.id.to_string(),
            status,
            verdict,
            fixes,
            story.title
        );
    }
    println!();
    Ok(())
}

/// Files `reset` would remove for `epic`, existing ones only.
fn reset_targets(config: &Config, epic: &Epic) -> Vec<PathBuf> {
    let mut targets = vec![config.checkpoint_path(epic.id), config.metrics_path(epic.id)];
    targets.extend(
        epic.stories
            .iter()
            .map(|s| config.story_record_path(&s.id.to_string())),
    );
    targets.retain(|p| p.exists());
    targets
}

pub fn cmd_reset(project_dir: &Path, epic_id: u32, force: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let epic = Epic::load(&config.stories_dir, epic_id)?;
    let targets = reset_targets(&config, &epic);

    println!();
    if targets.is_empty() {
        println!("Nothing to reset for epic {}.", epic_id);
        println!();
        return Ok(());
    }

    if !force {
        println!("Would remove:");
        for path in &targets {
            println!("  {}", config.relative(path).display());
        }
        println!();
        println!("Re-run with --force to delete.");
        println!();
        return Ok(());
    }

    // Refuses while a run holds the epic.
    let _lock = EpicLock::acquire(&config.lock_path(epic_id), epic_id, "reset")?;
    for path in &targets {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        tracing::debug!(path = %path.display(), "removed");
    }
    println!(
        "{} epic {} ({} files removed)",
        style("Reset").bold().green(),
        epic_id,
        targets.len()
    );
    println!();
    Ok(())
}
