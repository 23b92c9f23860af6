use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::flow_config::{CONFIG_FILE, FlowToml};

/// Name of the per-project state directory.
pub const EPICFLOW_DIR: &str = ".epicflow";

/// Runtime configuration for epicflow.
///
/// Resolves every on-disk location under the project directory and carries
/// the layered `FlowToml` settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub epicflow_dir: PathBuf,
    pub config_file: PathBuf,
    pub state_dir: PathBuf,
    pub story_state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub stories_dir: PathBuf,
    pub verbose: bool,
    pub flow: FlowToml,
    /// Problems found while applying the environment layer.
    pub env_warnings: Vec<String>,
}

impl Config {
    /// Load configuration for `project_dir`: defaults, then `epicflow.toml`,
    /// then environment overrides.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;

        let mut flow = FlowToml::load_or_default(&project_dir.join(EPICFLOW_DIR))?;
        let env_warnings = flow.apply_env_overrides();

        let mut config = Self::with_flow(project_dir, flow);
        config.verbose = verbose;
        config.env_warnings = env_warnings;
        Ok(config)
    }

    /// Build a configuration from already-resolved settings.
    pub fn with_flow(project_dir: PathBuf, flow: FlowToml) -> Self {
        let epicflow_dir = project_dir.join(EPICFLOW_DIR);
        let state_dir = epicflow_dir.join("state");
        let stories_dir = project_dir.join(&flow.project.stories_dir);

        Self {
            config_file: epicflow_dir.join(CONFIG_FILE),
            story_state_dir: state_dir.join("stories"),
            log_dir: epicflow_dir.join("logs"),
            reports_dir: epicflow_dir.join("reports"),
            state_dir,
            epicflow_dir,
            stories_dir,
            project_dir,
            verbose: false,
            flow,
            env_warnings: Vec::new(),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(&self.story_state_dir)
            .context("Failed to create story state directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.reports_dir).context("Failed to create reports directory")?;
        Ok(())
    }

    pub fn checkpoint_path(&self, epic: u32) -> PathBuf {
        self.state_dir.join(format!("epic-{}.checkpoint.json", epic))
    }

    pub fn metrics_path(&self, epic: u32) -> PathBuf {
        self.state_dir.join(format!("epic-{}.metrics.json", epic))
    }

    pub fn lock_path(&self, epic: u32) -> PathBuf {
        self.state_dir.join(format!("epic-{}.lock", epic))
    }

    pub fn story_record_path(&self, story_id: &str) -> PathBuf {
        self.story_state_dir.join(format!("{}.json", story_id))
    }

    /// Project name from config, falling back to the directory name.
    pub fn project_name(&self) -> String {
        self.flow.project.name.clone().unwrap_or_else(|| {
            self.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string())
        })
    }

    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.project_dir).unwrap_or(path)
    }
}
