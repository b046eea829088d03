//! Rollout collection: everything between "here is a batch of tasks" and
//! "here are graded sample groups".
//!
//! - [`types`] -- the [`types::Task`] capability and result/accounting types.
//! - [`governor`] -- the token-budget rate governor bounding in-flight work.
//! - [`early_stop`] -- the per-stream EMA monitor that abandons degenerate
//!   generations mid-stream.
//! - [`collector`] -- the concurrent fan-out that ties them together.

pub mod collector;
pub mod early_stop;
pub mod governor;
pub mod types;

pub use collector::RolloutCollector;
pub use early_stop::{EarlyStopMonitor, Verdict};
pub use governor::{BudgetPermit, TokenBudget};
pub use types::{
    Candidate, CollectError, CollectionStats, Grade, GradedSample, KeywordTask, SampleGroup, Task,
};
