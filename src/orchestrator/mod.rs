//! Story, epic and chain execution.
//!
//! The executors share one [`AgentRunner`], one [`Workspace`] and one
//! [`PromptFactory`]; each level owns its own persistence:
//!
//! | Module    | Owns                                              |
//! |-----------|---------------------------------------------------|
//! | `story`   | per-phase sequence, story records                 |
//! | `epic`    | story loop, checkpoint, metrics, epic phases      |
//! | `chain`   | epic sequence, acceptance blocking, chain report  |
//!
//! [`Workspace`]: crate::tracker::Workspace

pub mod chain;
pub mod epic;
pub mod lock;
pub mod metrics;
pub mod prompts;
pub mod runner;
pub mod shutdown;
pub mod state;
pub mod story;

pub use chain::{
    AcceptanceMode, ChainExecutor, ChainHalt, ChainOptions, ChainReport, HaltReason,
    JsonReportSink, ReportSink,
};
pub use epic::{EpicExecutor, EpicOutcome, EpicReport, EpicRunOptions, StorySummary};
pub use metrics::EpicMetrics;
pub use prompts::{GuidanceLoader, PromptFactory, PromptLimits};
pub use runner::{AgentRunner, Backoff, InvocationLabel, InvocationOutcome};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use state::{Checkpoint, CheckpointReason, CheckpointStore};
pub use story::{StoryExecutor, StoryOutcome};
