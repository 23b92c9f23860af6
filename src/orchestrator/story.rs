use crate::config::Config;
use crate::fixloop::{FixLoop, LoopState};
use crate::gates::{self, GateVerdict};
use crate::orchestrator::prompts::PromptFactory;
use crate::orchestrator::runner::AgentRunner;
use crate::phase::{PhaseResult, PhaseType, STORY_PHASES};
use crate::prompt::PromptWarning;
use crate::story::{PhaseRecord, Story, StoryId, StoryRecord, StoryStatus};
use crate::tracker::Workspace;
use anyhow::Result;
use chrono::Utc;

/// What happened to one story.
#[derive(Debug, Clone)]
pub struct StoryOutcome {
    pub record: StoryRecord,
    /// Phase and verdict that blocked the story.
    pub blocked_at: Option<(PhaseType, GateVerdict)>,
    pub warnings: Vec<(PhaseType, Vec<PromptWarning>)>,
    pub interrupted: bool,
}

impl StoryOutcome {
    pub fn status(&self) -> StoryStatus {
        self.record.status
    }
}

/// Runs the per-story phase sequence.
pub struct StoryExecutor<'a> {
    config: &'a Config,
    runner: &'a AgentRunner,
    workspace: &'a dyn Workspace,
    prompts: &'a PromptFactory,
}

impl<'a> StoryExecutor<'a> {
    pub fn new(
        config: &'a Config,
        runner: &'a AgentRunner,
        workspace: &'a dyn Workspace,
        prompts: &'a PromptFactory,
    ) -> Self {
        Self {
            config,
            runner,
            workspace,
            prompts,
        }
    }

    /// Dependencies whose persisted record is not `Done`.
    pub fn unmet_dependencies(&self, story: &Story) -> Vec<StoryId> {
        story
            .depends_on
            .iter()
            .filter(|dep| {
                let path = self.config.story_record_path(&dep.to_string());
                match StoryRecord::load(&path) {
                    Ok(Some(record)) => record.status != StoryStatus::Done,
                    Ok(None) => true,
                    Err(e) => {
                        tracing::warn!(dependency = %dep, error = %e, "unreadable dependency record");
                        true
                    }
                }
            })
            .copied()
            .collect()
    }

    pub async fn execute(&self, story: &Story) -> Result<StoryOutcome> {
        let scope = story.scope();
        let record_path = self.config.story_record_path(&story.id.to_string());
        let mut record = StoryRecord::new(story.id);
        let mut warnings = Vec::new();

        let unmet = self.unmet_dependencies(story);
        if !unmet.is_empty() {
            let list: Vec<String> = unmet.iter().map(|d| d.to_string()).collect();
            let reason = format!("dependencies not done: {}", list.join(", "));
            tracing::warn!(story = %story.id, %reason, "skipping story");
            record.finish(StoryStatus::Skipped, Some(reason));
            record.save(&record_path)?;
            return Ok(StoryOutcome {
                record,
                blocked_at: None,
                warnings,
                interrupted: false,
            });
        }

        tracing::info!(story = %story.id, title = %story.title, "starting story");
        record.begin();
        record.save(&record_path)?;

        let mut previous: Option<PhaseResult> = None;

        for phase in STORY_PHASES {
            if self.runner.shutdown().is_triggered() {
                return Ok(self.interrupted(record, warnings));
            }

            let changed = self.workspace.changed_files().unwrap_or_else(|e| {
                tracing::debug!(error = %e, "could not list changed files");
                Vec::new()
            });
            let prompt = self.prompts.story_phase(story, phase, previous.as_ref(), &changed);
            for w in &prompt.warnings {
                tracing::warn!(story = %story.id, %phase, "{}", w);
            }

            let policy = self.config.flow.fix_policy(phase);
            let outcome = FixLoop::new(self.runner, self.workspace, policy, &scope)
                .run(phase, prompt, |req| {
                    let p = self.prompts.story_fix(story, &req);
                    for w in &p.warnings {
                        tracing::warn!(story = %story.id, phase = %req.phase, "{}", w);
                    }
                    p
                })
                .await;

            if !outcome.warnings.is_empty() {
                warnings.push((phase, outcome.warnings.clone()));
            }
            if outcome.state == LoopState::Interrupted {
                return Ok(self.interrupted(record, warnings));
            }

            let verdict = gates::evaluate(&outcome.final_result, &self.config.flow.gates);
            tracing::info!(
                story = %story.id,
                %phase,
                %verdict,
                attempts = outcome.attempts.len(),
                result = %outcome.final_result.brief(),
                "phase finished"
            );

            // Hand-off: the next phase sees this phase's changes staged.
            if let Err(e) = self.workspace.stage_all() {
                tracing::warn!(story = %story.id, %phase, error = %e, "failed to stage phase changes");
            }

            let block_reason = if outcome.state == LoopState::Blocked || verdict == GateVerdict::Blocked {
                Some(format!(
                    "{} reported blocked: {}",
                    phase,
                    outcome.final_result.summary.as_deref().unwrap_or("no detail")
                ))
            } else if outcome.escalated {
                Some(format!("critical issue persisted in {} after fix attempts", phase))
            } else if verdict == GateVerdict::Fail && policy.hard_blocking {
                Some(format!("{} gate failed", phase))
            } else {
                if verdict == GateVerdict::Fail {
                    tracing::warn!(story = %story.id, %phase, "non-blocking gate failed, continuing");
                }
                None
            };

            record.push_phase(PhaseRecord {
                phase,
                initial: outcome.initial,
                attempts: outcome.attempts,
                result: outcome.final_result.clone(),
                verdict,
                documented: outcome.documented,
                escalated: outcome.escalated,
                finished_at: Utc::now(),
            });

            if let Some(reason) = block_reason {
                tracing::error!(story = %story.id, %phase, %verdict, %reason, "story blocked");
                record.finish(StoryStatus::Blocked, Some(reason));
                record.save(&record_path)?;
                return Ok(StoryOutcome {
                    record,
                    blocked_at: Some((phase, verdict)),
                    warnings,
                    interrupted: false,
                });
            }

            record.save(&record_path)?;
            previous = Some(outcome.final_result);
        }

        record.finish(StoryStatus::Done, None);
        record.save(&record_path)?;

        if self.config.flow.story.commit_on_done {
            let message = format!("story {}: done", story.id);
            match self.workspace.commit(&message) {
                Ok(Some(sha)) => tracing::info!(story = %story.id, commit = %sha, "story committed"),
                Ok(None) => tracing::debug!(story = %story.id, "nothing to commit"),
                Err(e) => tracing::warn!(story = %story.id, error = %e, "failed to commit story"),
            }
        }

        tracing::info!(story = %story.id, fix_attempts = record.total_fix_attempts(), "story done");
        Ok(StoryOutcome {
            record,
            blocked_at: None,
            warnings,
            interrupted: false,
        })
    }

    fn interrupted(
        &self,
        record: StoryRecord,
        warnings: Vec<(PhaseType, Vec<PromptWarning>)>,
    ) -> StoryOutcome {
        tracing::warn!(story = %record.story_id, "story interrupted");
        let path = self.config.story_record_path(&record.story_id.to_string());
        if let Err(e) = record.save(&path) {
            tracing::warn!(error = %e, "failed to persist interrupted story record");
        }
        StoryOutcome {
            record,
            blocked_at: None,
            warnings,
            interrupted: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentOutput, ExitStatus};
    use crate::flow_config::FlowToml;
    use crate::orchestrator::prompts::{GuidanceLoader, PromptLimits};
    use crate::orchestrator::runner::Backoff;
    use crate::tracker::NoopWorkspace;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Answers by phase, keyed on the signal token in the prompt's format section.
    struct PhaseAgent {
        answers: Vec<(&'static str, String)>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Agent for PhaseAgent {
        async fn invoke(&self, prompt: &str, _timeout: Duration) -> AgentOutput {
            let token = self
                .answers
                .iter()
                .find(|(token, _)| prompt.contains(&format!("`{}:", token)))
                .map(|(token, answer)| (token.to_string(), answer.clone()));
            match token {
                Some((token, answer)) => {
                    self.calls.lock().unwrap().push(token);
                    AgentOutput::new(answer, ExitStatus::Ok)
                }
                None => AgentOutput::new("no idea", ExitStatus::Ok),
            }
        }
    }

    fn all_pass() -> Vec<(&'static str, String)> {
        vec![
            ("DEV_STATUS", "DEV_STATUS: Complete - implemented".into()),
            ("ARCH_STATUS", "ARCH_STATUS: Complete".into()),
            ("REVIEW_STATUS", "REVIEW_STATUS: Complete".into()),
            ("TEST_QUALITY", "```json\n{\"status\": \"complete\", \"score\": 88}\n```".into()),
        ]
    }

    fn config(dir: &Path) -> Config {
        let config = Config::with_flow(dir.to_path_buf(), FlowToml::default());
        config.ensure_directories().unwrap();
        config
    }

    fn story(id: StoryId, deps: Vec<StoryId>) -> Story {
        Story {
            id,
            title: "Thing".into(),
            path: PathBuf::from(format!("docs/stories/{}-thing.md", id)),
            content: "# Thing".into(),
            depends_on: deps,
        }
    }

    async fn run(dir: &Path, answers: Vec<(&'static str, String)>, s: &Story) -> (StoryOutcome, Arc<PhaseAgent>, NoopWorkspace) {
        let config = config(dir);
        let agent = Arc::new(PhaseAgent {
            answers,
            calls: Mutex::new(Vec::new()),
        });
        let runner = AgentRunner::new(
            agent.clone(),
            Duration::from_secs(5),
            Backoff {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            &config.log_dir,
        );
        let ws = NoopWorkspace::new();
        let prompts = PromptFactory::new(
            PromptLimits::from(&config.flow.agent),
            GuidanceLoader::new(&config.epicflow_dir),
            "demo",
        );
        let outcome = StoryExecutor::new(&config, &runner, &ws, &prompts)
            .execute(s)
            .await
            .unwrap();
        (outcome, agent, ws)
    }

    #[tokio::test]
    async fn test_all_phases_pass_in_order_and_commit() {
        let dir = tempdir().unwrap();
        let s = story(StoryId::new(1, 1), vec![]);
        let (outcome, agent, ws) = run(dir.path(), all_pass(), &s).await;

        assert_eq!(outcome.status(), StoryStatus::Done);
        let phases: Vec<PhaseType> = outcome.record.history.iter().map(|r| r.phase).collect();
        assert_eq!(phases, STORY_PHASES.to_vec());
        assert_eq!(
            *agent.calls.lock().unwrap(),
            vec!["DEV_STATUS", "ARCH_STATUS", "REVIEW_STATUS", "TEST_QUALITY"]
        );
        assert_eq!(ws.commit_messages(), vec!["story 1.1: done".to_string()]);
        assert_eq!(ws.stage_count(), 4);

        let persisted = StoryRecord::load(&dir.path().join(".epicflow/state/stories/1.1.json"))
            .unwrap()
            .unwrap();
        assert_eq!(persisted.status, StoryStatus::Done);
    }

    #[tokio::test]
    async fn test_hard_blocking_failure_blocks_story() {
        let dir = tempdir().unwrap();
        let mut answers = all_pass();
        answers[1] = (
            "ARCH_STATUS",
            "```json\n{\"status\": \"failed\", \"issues\": [{\"severity\": \"high\", \"description\": \"layer violation\"}]}\n```".into(),
        );
        let s = story(StoryId::new(1, 1), vec![]);
        let (outcome, agent, ws) = run(dir.path(), answers, &s).await;

        assert_eq!(outcome.status(), StoryStatus::Blocked);
        assert_eq!(outcome.blocked_at, Some((PhaseType::ArchCompliance, GateVerdict::Fail)));
        let arch = &outcome.record.history[1];
        assert_eq!(arch.attempts.len(), 3);
        // Code review never starts.
        assert!(!agent.calls.lock().unwrap().contains(&"REVIEW_STATUS".to_string()));
        assert!(ws.commit_messages().is_empty());
    }

    #[tokio::test]
    async fn test_non_blocking_failure_continues() {
        let dir = tempdir().unwrap();
        let mut answers = all_pass();
        answers[3] = ("TEST_QUALITY", "```json\n{\"status\": \"complete\", \"score\": 40}\n```".into());
        let s = story(StoryId::new(1, 1), vec![]);
        let (outcome, _agent, _ws) = run(dir.path(), answers, &s).await;

        assert_eq!(outcome.status(), StoryStatus::Done);
        assert_eq!(outcome.record.last_verdict(), Some(GateVerdict::Fail));
    }

    #[tokio::test]
    async fn test_blocked_signal_stops_story() {
        let dir = tempdir().unwrap();
        let mut answers = all_pass();
        answers[0] = ("DEV_STATUS", "DEV_STATUS: Blocked - no database".into());
        let s = story(StoryId::new(1, 1), vec![]);
        let (outcome, agent, _ws) = run(dir.path(), answers, &s).await;

        assert_eq!(outcome.status(), StoryStatus::Blocked);
        assert_eq!(outcome.blocked_at, Some((PhaseType::Dev, GateVerdict::Blocked)));
        assert_eq!(agent.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unmet_dependency_skips() {
        let dir = tempdir().unwrap();
        let s = story(StoryId::new(1, 2), vec![StoryId::new(1, 1)]);
        let (outcome, agent, _ws) = run(dir.path(), all_pass(), &s).await;
        assert_eq!(outcome.status(), StoryStatus::Skipped);
        assert!(agent.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_done_dependency_runs() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let mut dep = StoryRecord::new(StoryId::new(1, 1));
        dep.finish(StoryStatus::Done, None);
        dep.save(&config.story_record_path("1.1")).unwrap();

        let s = story(StoryId::new(1, 2), vec![StoryId::new(1, 1)]);
        let (outcome, _agent, _ws) = run(dir.path(), all_pass(), &s).await;
        assert_eq!(outcome.status(), StoryStatus::Done);
    }
}
