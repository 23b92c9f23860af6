//! The external agent boundary.
//!
//! Everything the orchestrator knows about the agent is `invoke(prompt,
//! timeout)` returning text plus one of four exit outcomes. Environment
//! differences (missing binary, odd exit codes, hangs) are folded into that
//! closed set here so nothing above this module inspects processes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ExitStatus {
    Ok,
    NonZero(i32),
    Timeout,
    SpawnError(String),
}

impl ExitStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExitStatus::Ok)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Ok => write!(f, "ok"),
            ExitStatus::NonZero(code) => write!(f, "exit {}", code),
            ExitStatus::Timeout => write!(f, "timeout"),
            ExitStatus::SpawnError(msg) => write!(f, "spawn error: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub output: String,
    pub exit: ExitStatus,
}

impl AgentOutput {
    pub fn new(output: impl Into<String>, exit: ExitStatus) -> Self {
        Self {
            output: output.into(),
            exit,
        }
    }
}

/// A generative agent: prompt in, text out, bounded by `timeout`.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, prompt: &str, timeout: Duration) -> AgentOutput;
}

/// Runs the agent as a child process, prompt on stdin, answer on stdout.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CommandAgent {
    pub fn new(command: &str, args: Vec<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            command: command.to_string(),
            args,
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }

    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn invoke(&self, prompt: &str, limit: Duration) -> AgentOutput {
        let mut child = match Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return AgentOutput::new(String::new(), ExitStatus::SpawnError(e.to_string()));
            }
        };

        tracing::debug!(pid = child.id().unwrap_or(0), command = %self.command_line(), "agent spawned");

        // Stdin is fed from its own task so the timeout also bounds the write.
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_owned();
            tokio::spawn(async move {
                // A child that exits without reading stdin is reported through its exit code.
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::warn!(error = %e, "failed to write prompt to agent stdin");
                    return;
                }
                if let Err(e) = stdin.shutdown().await {
                    tracing::debug!(error = %e, "failed to close agent stdin");
                }
            })
        });

        // The child is dropped on timeout, and kill_on_drop terminates it.
        let waited = timeout(limit, child.wait_with_output()).await;
        if let Some(writer) = writer {
            writer.abort();
        }
        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return AgentOutput::new(String::new(), ExitStatus::SpawnError(e.to_string()));
            }
            Err(_) => return AgentOutput::new(String::new(), ExitStatus::Timeout),
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&stderr);
        }

        let exit = match output.status.code() {
            Some(0) => ExitStatus::Ok,
            Some(code) => ExitStatus::NonZero(code),
            // Killed by a signal.
            None => ExitStatus::NonZero(-1),
        };

        AgentOutput::new(text, exit)
    }
}
