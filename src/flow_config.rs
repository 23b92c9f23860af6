//! Project configuration read from `.epicflow/epicflow.toml`.
//!
//! Layering is defaults → file → environment → CLI. The CLI layer is applied
//! by the caller; this module owns the first three.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//! stories_dir = "docs/stories"
//!
//! [agent]
//! command = "claude"
//! args = ["--print"]
//! skip_permissions = false
//! timeout_secs = 600
//! max_prompt_chars = 400000
//! min_fragment_chars = 256
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//!
//! [checkpoint]
//! max_age_hours = 24
//!
//! [gates]
//! test_quality_pass = 70
//! test_quality_concerns = 60
//! review_issue_threshold = 5
//!
//! [story]
//! commit_on_done = true
//!
//! [phases.code_review]
//! max_attempts = 2
//! hard_blocking = false
//! ```

use crate::errors::ConfigurationError;
use crate::fixloop::FixPolicy;
use crate::gates::GateThresholds;
use crate::phase::PhaseType;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// File name inside the `.epicflow` directory.
pub const CONFIG_FILE: &str = "epicflow.toml";

pub const ENV_AGENT_CMD: &str = "EPICFLOW_AGENT_CMD";
pub const ENV_TIMEOUT_SECS: &str = "EPICFLOW_TIMEOUT_SECS";

const SKIP_PERMISSIONS_FLAG: &str = "--dangerously-skip-permissions";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (optional, defaults to directory name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Story files directory, relative to the project root
    #[serde(default = "default_stories_dir")]
    pub stories_dir: String,
}

fn default_stories_dir() -> String {
    "docs/stories".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: None,
            stories_dir: default_stories_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub skip_permissions: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_min_fragment_chars")]
    pub min_fragment_chars: usize,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_prompt_chars() -> usize {
    400_000
}

fn default_min_fragment_chars() -> usize {
    256
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            skip_permissions: false,
            timeout_secs: default_timeout_secs(),
            max_prompt_chars: default_max_prompt_chars(),
            min_fragment_chars: default_min_fragment_chars(),
        }
    }
}

/// Backoff for transient invocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckpointSection {
    /// Checkpoints older than this are ignored on resume.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

fn default_max_age_hours() -> u64 {
    24
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            max_age_hours: default_max_age_hours(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorySection {
    /// Commit the working tree when a story reaches Done.
    #[serde(default = "default_commit_on_done")]
    pub commit_on_done: bool,
}

fn default_commit_on_done() -> bool {
    true
}

impl Default for StorySection {
    fn default() -> Self {
        Self {
            commit_on_done: default_commit_on_done(),
        }
    }
}

/// Per-phase fix-loop overrides. Unset fields keep the built-in default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium_issue_threshold: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_blocking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_retries: Option<u32>,
}

/// The complete epicflow.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub gates: GateThresholds,
    #[serde(default)]
    pub story: StorySection,
    /// Keyed by phase key (`dev`, `code_review`, ...).
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseOverride>,
}

impl FlowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ConfigurationError::InvalidConfig(e.to_string()))
            .context("Failed to parse epicflow.toml")
    }

    /// Load `<epicflow_dir>/epicflow.toml`, or defaults when the file is absent.
    pub fn load_or_default(epicflow_dir: &Path) -> Result<Self> {
        let config_path = epicflow_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize epicflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply the environment layer from the process environment.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply the environment layer from `lookup`. Returns a warning for each
    /// variable that is set but unusable.
    pub fn apply_env<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();

        if let Some(cmd) = lookup(ENV_AGENT_CMD)
            && !cmd.trim().is_empty()
        {
            self.agent.command = cmd.trim().to_string();
        }

        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.agent.timeout_secs = secs,
                _ => warnings.push(format!(
                    "Ignoring {}='{}': expected a positive number of seconds",
                    ENV_TIMEOUT_SECS, raw
                )),
            }
        }

        warnings
    }

    /// Arguments passed to the agent command.
    pub fn agent_args(&self) -> Vec<String> {
        let mut args = self.agent.args.clone();
        if self.agent.skip_permissions && !args.iter().any(|a| a == SKIP_PERMISSIONS_FLAG) {
            args.push(SKIP_PERMISSIONS_FLAG.to_string());
        }
        args
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    /// Effective fix policy for `phase`: built-in default plus overrides.
    pub fn fix_policy(&self, phase: PhaseType) -> FixPolicy {
        let mut policy = FixPolicy::default_for(phase);
        if let Some(over) = self.phases.get(phase.key()) {
            if let Some(max_attempts) = over.max_attempts {
                policy.max_attempts = max_attempts;
            }
            if let Some(threshold) = over.medium_issue_threshold {
                policy.medium_issue_threshold = threshold;
            }
            if let Some(hard_blocking) = over.hard_blocking {
                policy.hard_blocking = hard_blocking;
            }
            if let Some(timeout_retries) = over.timeout_retries {
                policy.timeout_retries = timeout_retries;
            }
        }
        policy
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.agent.command.trim().is_empty() {
            errors.push("agent.command must not be empty".to_string());
        }
        if self.agent.timeout_secs == 0 {
            errors.push("agent.timeout_secs must be greater than 0".to_string());
        }
        if self.agent.min_fragment_chars > self.agent.max_prompt_chars {
            errors.push(format!(
                "agent.min_fragment_chars ({}) exceeds agent.max_prompt_chars ({})",
                self.agent.min_fragment_chars, self.agent.max_prompt_chars
            ));
        }
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        if self.checkpoint.max_age_hours == 0 {
            errors.push("checkpoint.max_age_hours must be greater than 0".to_string());
        }
        if self.project.stories_dir.trim().is_empty() {
            errors.push("project.stories_dir must not be empty".to_string());
        }

        errors.extend(self.gates.validate());

        for key in self.phases.keys() {
            if PhaseType::from_key(key).is_none() {
                errors.push(format!(
                    "Unknown phase '{}' in [phases]. Valid phases: {}",
                    key,
                    PhaseType::ALL
                        .iter()
                        .map(|p| p.key())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
        }

        errors
    }
}
