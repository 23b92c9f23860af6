//! Severity-gated self-healing.
//!
//! `policy` holds the pure decision function; `controller` drives the agent
//! through fix attempts until the policy accepts the result or gives up.

mod controller;
mod policy;

pub use controller::{FixAttempt, FixLoop, FixLoopOutcome, FixRequest, LoopState};
pub use policy::{FixDecision, FixPolicy, FixReason, actionable_issues, decide};
