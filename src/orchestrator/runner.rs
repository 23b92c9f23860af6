use crate::agent::{Agent, AgentOutput, ExitStatus};
use crate::errors::InvocationError;
use crate::flow_config::RetrySection;
use crate::orchestrator::shutdown::Shutdown;
use crate::phase::{ExtractionSource, PhaseResult, PhaseStatus, PhaseType};
use crate::signals;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Exponential backoff for transient invocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<RetrySection> for Backoff {
    fn from(retry: RetrySection) -> Self {
        Self {
            max_attempts: retry.max_attempts.max(1),
            initial_delay: Duration::from_millis(retry.initial_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
        }
    }
}

/// What came back from the agent once transient failures were absorbed.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// The agent answered. A non-zero exit with a structured result lands here too.
    Completed { output: String, exit: ExitStatus },
    /// Wall-clock timeout. Never retried by the backoff.
    TimedOut { secs: u64 },
    /// Transient failures outlasted the backoff budget.
    Failed { error: InvocationError, output: String },
    /// Shutdown was requested while the agent was running.
    Interrupted,
}

impl InvocationOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, InvocationOutcome::TimedOut { .. })
    }

    /// Extract the phase result. Timeouts and exhausted retries become `Failed`.
    pub fn into_result(self, phase: PhaseType) -> PhaseResult {
        match self {
            InvocationOutcome::Completed { output, .. } => signals::extract(&output, phase),
            InvocationOutcome::TimedOut { secs } => {
                PhaseResult::new(phase, PhaseStatus::Failed, ExtractionSource::Invocation)
                    .with_summary(&InvocationError::Timeout { secs }.to_string())
            }
            InvocationOutcome::Failed { error, .. } => {
                PhaseResult::new(phase, PhaseStatus::Failed, ExtractionSource::Invocation)
                    .with_summary(&error.to_string())
            }
            InvocationOutcome::Interrupted => {
                PhaseResult::new(phase, PhaseStatus::Unclear, ExtractionSource::Invocation)
                    .with_summary("interrupted")
            }
        }
    }
}

/// One invocation request.
#[derive(Debug, Clone, Copy)]
pub struct InvocationLabel<'a> {
    /// `story-3.2` or `epic-3`
    pub scope: &'a str,
    pub phase: PhaseType,
    /// Fix-loop attempt, 0 for the initial invocation.
    pub attempt: u32,
}

/// Drives the agent: timeout, backoff on transient failures, transcripts.
#[derive(Clone)]
pub struct AgentRunner {
    agent: Arc<dyn Agent>,
    timeout: Duration,
    backoff: Backoff,
    log_dir: PathBuf,
    shutdown: Shutdown,
}

impl AgentRunner {
    pub fn new(agent: Arc<dyn Agent>, timeout: Duration, backoff: Backoff, log_dir: &Path) -> Self {
        Self {
            agent,
            timeout,
            backoff,
            log_dir: log_dir.to_path_buf(),
            shutdown: Shutdown::never(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn transcript_paths(&self, label: &InvocationLabel<'_>, try_number: u32) -> (PathBuf, PathBuf) {
        let stem = if try_number <= 1 {
            format!("{}-{}-attempt-{}", label.scope, label.phase, label.attempt)
        } else {
            format!(
                "{}-{}-attempt-{}.{}",
                label.scope, label.phase, label.attempt, try_number
            )
        };
        (
            self.log_dir.join(format!("{}-prompt.md", stem)),
            self.log_dir.join(format!("{}-output.log", stem)),
        )
    }

    pub async fn invoke(&self, label: InvocationLabel<'_>, prompt: &str) -> InvocationOutcome {
        let digest = prompt_digest(prompt);
        let mut try_number = 0;

        loop {
            try_number += 1;
            if self.shutdown.is_triggered() {
                return InvocationOutcome::Interrupted;
            }

            let (prompt_file, output_file) = self.transcript_paths(&label, try_number);
            write_transcript(&prompt_file, prompt);

            tracing::info!(
                scope = label.scope,
                phase = %label.phase,
                attempt = label.attempt,
                try_number,
                prompt_chars = prompt.chars().count(),
                prompt_sha = %digest,
                "invoking agent"
            );

            let start = Instant::now();
            let mut shutdown = self.shutdown.clone();
            let output = tokio::select! {
                out = self.agent.invoke(prompt, self.timeout) => out,
                _ = shutdown.wait() => return InvocationOutcome::Interrupted,
            };
            write_transcript(&output_file, &output.output);

            tracing::debug!(
                phase = %label.phase,
                exit = %output.exit,
                elapsed_ms = start.elapsed().as_millis() as u64,
                output_chars = output.output.len(),
                "agent returned"
            );

            let error = match classify(output, label.phase, self.timeout.as_secs()) {
                Ok(outcome) => return outcome,
                Err((error, output)) => {
                    if try_number >= self.backoff.max_attempts {
                        tracing::warn!(
                            phase = %label.phase,
                            tries = try_number,
                            error = %error,
                            "transient failures exhausted the retry budget"
                        );
                        return InvocationOutcome::Failed { error, output };
                    }
                    error
                }
            };

            let delay = self.backoff.delay_for(try_number);
            tracing::warn!(
                phase = %label.phase,
                error = %error,
                "transient agent failure, retry {}/{} in {}ms",
                try_number,
                self.backoff.max_attempts - 1,
                delay.as_millis()
            );
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => return InvocationOutcome::Interrupted,
            }
        }
    }
}

/// Map the raw exit onto an outcome, or a transient error worth retrying.
fn classify(
    output: AgentOutput,
    phase: PhaseType,
    timeout_secs: u64,
) -> Result<InvocationOutcome, (InvocationError, String)> {
    match output.exit {
        ExitStatus::Ok => Ok(InvocationOutcome::Completed {
            output: output.output,
            exit: ExitStatus::Ok,
        }),
        ExitStatus::Timeout => Ok(InvocationOutcome::TimedOut { secs: timeout_secs }),
        ExitStatus::NonZero(code) => {
            if signals::extract_structured(&output.output, phase).is_ok() {
                Ok(InvocationOutcome::Completed {
                    output: output.output,
                    exit: ExitStatus::NonZero(code),
                })
            } else {
                Err((
                    InvocationError::Transient(format!("agent exited with code {}", code)),
                    output.output,
                ))
            }
        }
        ExitStatus::SpawnError(msg) => Err((
            InvocationError::Transient(format!("failed to start agent: {}", msg)),
            output.output,
        )),
    }
}

fn write_transcript(path: &Path, content: &str) {
    if let Some(parent) = path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::warn!(dir = %parent.display(), error = %e, "failed to create transcript directory");
        return;
    }
    if let Err(e) = std::fs::write(path, content) {
        tracing::warn!(path = %path.display(), error = %e, "failed to write transcript");
    }
}

/// Short SHA-256 digest of a prompt for log correlation.
pub fn prompt_digest(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let result = hasher.finalize();
    format!("{:x}", result)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Replays a fixed list of outputs, repeating the last one.
    struct Scripted {
        outputs: Mutex<Vec<AgentOutput>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(outputs: Vec<AgentOutput>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Agent for Scripted {
        async fn invoke(&self, _prompt: &str, _timeout: Duration) -> AgentOutput {
            *self.calls.lock().unwrap() += 1;
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.len() > 1 {
                outputs.remove(0)
            } else {
                outputs[0].clone()
            }
        }
    }

    fn fast_backoff(max_attempts: u32) -> Backoff {
        Backoff {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn label() -> InvocationLabel<'static> {
        InvocationLabel {
            scope: "story-1.1",
            phase: PhaseType::Dev,
            attempt: 0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(350));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_spawn_error_is_retried_then_succeeds() {
        let dir = tempdir().unwrap();
        let agent = Scripted::new(vec![
            AgentOutput::new("", ExitStatus::SpawnError("busy".into())),
            AgentOutput::new("DEV_STATUS: Complete", ExitStatus::Ok),
        ]);
        let runner = AgentRunner::new(agent.clone(), Duration::from_secs(1), fast_backoff(3), dir.path());
        let outcome = runner.invoke(label(), "do it").await;
        assert!(matches!(outcome, InvocationOutcome::Completed { .. }));
        assert_eq!(agent.calls(), 2);
        assert!(dir.path().join("story-1.1-dev-attempt-0-prompt.md").exists());
        assert!(dir.path().join("story-1.1-dev-attempt-0.2-output.log").exists());
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let dir = tempdir().unwrap();
        let agent = Scripted::new(vec![AgentOutput::new("", ExitStatus::Timeout)]);
        let runner = AgentRunner::new(agent.clone(), Duration::from_secs(1), fast_backoff(5), dir.path());
        let outcome = runner.invoke(label(), "do it").await;
        assert!(outcome.is_timeout());
        assert_eq!(agent.calls(), 1);
        let result = outcome.into_result(PhaseType::Dev);
        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(result.source, ExtractionSource::Invocation);
    }

    #[tokio::test]
    async fn test_nonzero_with_structured_result_is_not_retried() {
        let dir = tempdir().unwrap();
        let agent = Scripted::new(vec![AgentOutput::new(
            "REVIEW_STATUS: Failed - 2 bugs",
            ExitStatus::NonZero(1),
        )]);
        let runner = AgentRunner::new(agent.clone(), Duration::from_secs(1), fast_backoff(3), dir.path());
        let outcome = runner.invoke(
            InvocationLabel {
                phase: PhaseType::CodeReview,
                ..label()
            },
            "review",
        )
        .await;
        assert_eq!(agent.calls(), 1);
        let result = outcome.into_result(PhaseType::CodeReview);
        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(result.source, ExtractionSource::SignalLine);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_budget() {
        let dir = tempdir().unwrap();
        let agent = Scripted::new(vec![AgentOutput::new("boom", ExitStatus::NonZero(2))]);
        let runner = AgentRunner::new(agent.clone(), Duration::from_secs(1), fast_backoff(3), dir.path());
        let outcome = runner.invoke(label(), "do it").await;
        assert_eq!(agent.calls(), 3);
        assert!(matches!(
            outcome,
            InvocationOutcome::Failed { error: InvocationError::Transient(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_triggered_shutdown_skips_invocation() {
        let dir = tempdir().unwrap();
        let agent = Scripted::new(vec![AgentOutput::new("DEV_STATUS: Complete", ExitStatus::Ok)]);
        let (trigger, shutdown) = crate::orchestrator::shutdown::channel();
        trigger.trigger();
        let runner = AgentRunner::new(agent.clone(), Duration::from_secs(1), fast_backoff(3), dir.path())
            .with_shutdown(shutdown);
        assert_eq!(runner.invoke(label(), "x").await, InvocationOutcome::Interrupted);
        assert_eq!(agent.calls(), 0);
    }

    #[test]
    fn test_prompt_digest_is_stable() {
        assert_eq!(prompt_digest("abc"), prompt_digest("abc"));
        assert_ne!(prompt_digest("abc"), prompt_digest("abd"));
        assert_eq!(prompt_digest("abc").len(), 12);
    }
}
