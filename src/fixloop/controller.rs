use super::policy::{FixDecision, FixPolicy, FixReason, decide};
use crate::gates::{self, GateThresholds, GateVerdict};
use crate::orchestrator::runner::{AgentRunner, InvocationLabel, InvocationOutcome};
use crate::phase::{Issue, PhaseResult, PhaseType, Severity};
use crate::prompt::{AssembledPrompt, PromptWarning};
use crate::tracker::Workspace;
use serde::{Deserialize, Serialize};

/// One remediation round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixAttempt {
    /// 1-based, strictly increasing, at most the policy's `max_attempts`.
    pub attempt: u32,
    pub reason: FixReason,
    /// Issues the remediation prompt asked the agent to fix.
    pub targets: Vec<Issue>,
    pub result: PhaseResult,
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Accepted,
    AcceptedWithIssues,
    Exhausted,
    Blocked,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct FixLoopOutcome {
    pub initial: PhaseResult,
    pub final_result: PhaseResult,
    pub attempts: Vec<FixAttempt>,
    pub state: LoopState,
    /// A Critical issue survived every attempt.
    pub escalated: bool,
    /// Issues accepted without being fixed.
    pub documented: Vec<Issue>,
    pub warnings: Vec<PromptWarning>,
}

/// Input for building a remediation prompt.
pub struct FixRequest<'a> {
    pub phase: PhaseType,
    pub attempt: u32,
    pub reason: FixReason,
    pub targets: &'a [Issue],
    pub previous: &'a PhaseResult,
}

/// Runs a phase and its severity-gated fix loop.
pub struct FixLoop<'a> {
    runner: &'a AgentRunner,
    workspace: &'a dyn Workspace,
    policy: FixPolicy,
    scope: &'a str,
    gate: Option<&'a GateThresholds>,
}

impl<'a> FixLoop<'a> {
    pub fn new(
        runner: &'a AgentRunner,
        workspace: &'a dyn Workspace,
        policy: FixPolicy,
        scope: &'a str,
    ) -> Self {
        Self {
            runner,
            workspace,
            policy,
            scope,
            gate: None,
        }
    }

    /// Keep fixing while the result fails its gate, even if the policy
    /// would accept it.
    pub fn with_gate(mut self, thresholds: &'a GateThresholds) -> Self {
        self.gate = Some(thresholds);
        self
    }

    fn below_gate(&self, result: &PhaseResult) -> bool {
        self.gate
            .is_some_and(|t| gates::evaluate(result, t) == GateVerdict::Fail)
    }

    /// Apply the gate check on top of the policy decision.
    fn next_step(&self, current: &PhaseResult, made: u32) -> FixDecision {
        let decision = decide(current, &self.policy, made);
        let accepted = matches!(decision, FixDecision::Accept | FixDecision::AcceptWithIssues(_));
        if !accepted || !self.below_gate(current) {
            return decision;
        }
        let targets = current.issues.iter().filter(|i| i.fixable).cloned().collect();
        if made >= self.policy.max_attempts {
            FixDecision::Exhausted {
                open: targets,
                reason: FixReason::BelowGate,
            }
        } else {
            FixDecision::Fix {
                attempt: made + 1,
                targets,
                reason: FixReason::BelowGate,
            }
        }
    }

    /// Invoke the phase with `initial_prompt`, then remediate until the
    /// policy accepts the result or gives up.
    pub async fn run<F>(
        &self,
        phase: PhaseType,
        initial_prompt: AssembledPrompt,
        remediation: F,
    ) -> FixLoopOutcome
    where
        F: Fn(FixRequest<'_>) -> AssembledPrompt,
    {
        let mut warnings = initial_prompt.warnings.clone();
        let mut timeout_budget = self.policy.timeout_retries;

        let (initial, interrupted, timed_out) = self.invoke(phase, 0, &initial_prompt.text).await;
        if interrupted {
            return self.finish(initial.clone(), initial, Vec::new(), LoopState::Interrupted, Vec::new(), warnings);
        }

        let mut attempts: Vec<FixAttempt> = Vec::new();
        let mut current = initial.clone();
        let mut last_timed_out = timed_out;

        // Hard bound on top of the policy.
        for _ in 0..=self.policy.max_attempts {
            if last_timed_out {
                if timeout_budget == 0 {
                    tracing::warn!(scope = self.scope, phase = %phase, "agent timed out again, giving up on phase");
                    return self.finish(initial, current, attempts, LoopState::Exhausted, Vec::new(), warnings);
                }
                timeout_budget -= 1;
            }

            let made = attempts.len() as u32;
            match self.next_step(&current, made) {
                FixDecision::Accept => {
                    return self.finish(initial, current, attempts, LoopState::Accepted, Vec::new(), warnings);
                }
                FixDecision::AcceptWithIssues(documented) => {
                    return self.finish(initial, current, attempts, LoopState::AcceptedWithIssues, documented, warnings);
                }
                FixDecision::Blocked => {
                    return self.finish(initial, current, attempts, LoopState::Blocked, Vec::new(), warnings);
                }
                FixDecision::Exhausted { open, reason } => {
                    tracing::warn!(
                        scope = self.scope,
                        phase = %phase,
                        attempts = made,
                        open = open.len(),
                        %reason,
                        "fix attempts exhausted"
                    );
                    return self.finish(initial, current, attempts, LoopState::Exhausted, Vec::new(), warnings);
                }
                FixDecision::Fix {
                    attempt,
                    targets,
                    reason,
                } => {
                    debug_assert!(attempt == made + 1 && attempt <= self.policy.max_attempts);
                    tracing::info!(
                        scope = self.scope,
                        phase = %phase,
                        attempt,
                        max = self.policy.max_attempts,
                        targets = targets.len(),
                        %reason,
                        "starting fix attempt"
                    );

                    let prompt = remediation(FixRequest {
                        phase,
                        attempt,
                        reason,
                        targets: &targets,
                        previous: &current,
                    });
                    warnings.extend(prompt.warnings.iter().cloned());

                    let (result, interrupted, timed_out) = self.invoke(phase, attempt, &prompt.text).await;
                    if interrupted {
                        return self.finish(initial, current, attempts, LoopState::Interrupted, Vec::new(), warnings);
                    }

                    if let Err(e) = self.workspace.stage_all() {
                        tracing::warn!(error = %e, phase = %phase, "failed to stage fix attempt changes");
                    }

                    attempts.push(FixAttempt {
                        attempt,
                        reason,
                        targets,
                        result: result.clone(),
                        timed_out,
                    });
                    current = result;
                    last_timed_out = timed_out;
                }
            }
        }

        self.finish(initial, current, attempts, LoopState::Exhausted, Vec::new(), warnings)
    }

    async fn invoke(&self, phase: PhaseType, attempt: u32, prompt: &str) -> (PhaseResult, bool, bool) {
        let label = InvocationLabel {
            scope: self.scope,
            phase,
            attempt,
        };
        let outcome = self.runner.invoke(label, prompt).await;
        let interrupted = outcome == InvocationOutcome::Interrupted;
        let timed_out = outcome.is_timeout();
        (outcome.into_result(phase), interrupted, timed_out)
    }

    fn finish(
        &self,
        initial: PhaseResult,
        final_result: PhaseResult,
        attempts: Vec<FixAttempt>,
        state: LoopState,
        documented: Vec<Issue>,
        warnings: Vec<PromptWarning>,
    ) -> FixLoopOutcome {
        let escalated =
            state == LoopState::Exhausted && final_result.has_severity_at_least(Severity::Critical);
        if escalated {
            tracing::error!(
                scope = self.scope,
                phase = %final_result.phase,
                critical = final_result.count_at(Severity::Critical),
                "critical issue persists after fix attempts, escalating"
            );
        }
        FixLoopOutcome {
            initial,
            final_result,
            attempts,
            state,
            escalated,
            documented,
            warnings,
        }
    }
}
