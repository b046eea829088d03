//! Core rollout data types and the task capability.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::MetricsAccumulator;

// ---------------------------------------------------------------------------
// Task capability
// ---------------------------------------------------------------------------

/// One unit of work: a prompt plus the ability to grade a candidate
/// completion. Tasks are constructed once per experiment, never mutated, and
/// shared read-only across all concurrent samples.
#[async_trait]
pub trait Task: Send + Sync {
    /// Stable identifier used to group samples.
    fn id(&self) -> &str;

    /// The prompt sent to the inference backend.
    fn prompt(&self) -> &str;

    /// The tokenized prompt, fixed at construction. Needed so packed
    /// sequences carry the full prompt + completion token ids.
    fn prompt_tokens(&self) -> &[u32];

    /// Score one candidate completion. May be slow and may fail; failures
    /// are absorbed by the collector as per-choice exceptions.
    async fn grade(&self, candidate: &Candidate) -> Result<Grade>;
}

/// A candidate completion handed to a grader.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Accumulated completion text.
    pub text: String,
    /// Completion token ids (may be empty if the backend reported none).
    pub token_ids: Vec<u32>,
    /// Per-token log-probabilities, parallel to `token_ids`, when complete.
    pub logprobs: Option<Vec<f64>>,
    /// Whether generation was abandoned by the early-stop monitor. Graders
    /// that cannot score truncated text should fail in this case.
    pub early_stopped: bool,
}

/// The outcome of grading one candidate.
#[derive(Debug, Clone)]
pub struct Grade {
    /// Scalar reward.
    pub reward: f64,
    /// Named auxiliary metrics, summed across samples by the collector.
    pub metrics: HashMap<String, f64>,
}

impl Grade {
    /// A grade carrying only a reward.
    pub fn reward(reward: f64) -> Self {
        Self {
            reward,
            metrics: HashMap::new(),
        }
    }
}

/// A task graded by whether the completion mentions a keyword. Used by mock
/// runs, tests, and `--tasks` files; real experiments supply their own
/// [`Task`] implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordTask {
    id: String,
    prompt: String,
    prompt_tokens: Vec<u32>,
    keyword: String,
}

impl KeywordTask {
    pub fn new(id: &str, prompt: &str, prompt_tokens: Vec<u32>, keyword: &str) -> Self {
        Self {
            id: id.to_string(),
            prompt: prompt.to_string(),
            prompt_tokens,
            keyword: keyword.to_string(),
        }
    }
}

#[async_trait]
impl Task for KeywordTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn prompt_tokens(&self) -> &[u32] {
        &self.prompt_tokens
    }

    async fn grade(&self, candidate: &Candidate) -> Result<Grade> {
        let reward = if candidate.text.contains(&self.keyword) {
            1.0
        } else {
            0.0
        };
        let mut grade = Grade::reward(reward);
        grade
            .metrics
            .insert("chars".to_string(), candidate.text.len() as f64);
        Ok(grade)
    }
}

// ---------------------------------------------------------------------------
// Collection results
// ---------------------------------------------------------------------------

/// One graded candidate completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradedSample {
    pub task_id: String,
    pub choice_index: usize,
    pub reward: f64,
    /// Completion token ids.
    pub token_ids: Vec<u32>,
    /// Per-token log-probabilities, parallel to `token_ids`.
    pub logprobs: Option<Vec<f64>>,
    /// Completion length from the backend's usage report, falling back to
    /// the observed token count.
    pub completion_tokens: u64,
    /// Whether this sample was truncated by the early-stop monitor.
    pub early_stopped: bool,
}

/// All graded samples sharing one task from a single collection round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleGroup {
    pub task_id: String,
    pub samples: Vec<GradedSample>,
}

impl SampleGroup {
    pub fn rewards(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.reward).collect()
    }
}

/// Aggregated accounting for one collection round. Partial failures are
/// absorbed here instead of aborting sibling work.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionStats {
    /// Successfully graded samples.
    pub grades: u64,
    /// Requests that reported usable token totals.
    pub usages: u64,
    /// Failed requests plus failed grades.
    pub exceptions: u64,
    /// Streams abandoned by the early-stop monitor and excluded from
    /// grading. Tracked separately from exceptions.
    pub early_stops: u64,
    /// Sum of rewards over graded samples.
    pub total_reward: f64,
    /// Sum of completion token counts over graded samples.
    pub completion_tokens: u64,
    /// Auxiliary grader metrics, merged by key.
    pub metrics: MetricsAccumulator,
}

impl CollectionStats {
    pub fn mean_reward(&self) -> f64 {
        if self.grades == 0 {
            0.0
        } else {
            self.total_reward / self.grades as f64
        }
    }

    pub fn mean_completion_tokens(&self) -> f64 {
        if self.grades == 0 {
            0.0
        } else {
            self.completion_tokens as f64 / self.grades as f64
        }
    }

    /// Fold another round of accounting into this one.
    pub fn absorb(&mut self, other: &CollectionStats) {
        self.grades += other.grades;
        self.usages += other.usages;
        self.exceptions += other.exceptions;
        self.early_stops += other.early_stops;
        self.total_reward += other.total_reward;
        self.completion_tokens += other.completion_tokens;
        self.metrics.merge(&other.metrics);
    }
}

/// Fatal collection failures. Everything recoverable is counted in
/// [`CollectionStats`] instead.
#[derive(Debug, Error)]
pub enum CollectError {
    /// No sample in the whole batch could be graded; there is no training or
    /// validation signal to extract.
    #[error("no gradable samples across {tasks} tasks ({exceptions} exceptions)")]
    NoGradableSamples { tasks: usize, exceptions: u64 },

    /// No request reported usable token totals, so completion-length
    /// calibration (and therefore the next round's admission budget) would
    /// be undefined.
    #[error("no usable token totals across {tasks} tasks ({exceptions} exceptions)")]
    NoUsableUsage { tasks: usize, exceptions: u64 },
}
