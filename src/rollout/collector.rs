//! Rollout collection: concurrent generation fan-out, grading, and
//! accounting.
//!
//! For every task in a batch the collector issues one governor-gated
//! generation request for `n` candidate completions, consumes each choice's
//! chunk stream while feeding the early-stop monitor, grades completed
//! candidates concurrently, and folds everything into [`CollectionStats`].
//! Individual request or grading failures never abort sibling work; the
//! round as a whole fails only when it produced no signal at all.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{EarlyStopConfig, SamplingConfig};
use crate::model::{ChoiceStream, CompletionBackend, GenerationRequest};
use crate::rollout::early_stop::{EarlyStopMonitor, Verdict};
use crate::rollout::governor::TokenBudget;
use crate::rollout::types::{
    Candidate, CollectError, CollectionStats, GradedSample, SampleGroup, Task,
};

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Orchestrates one collection round against an inference backend.
pub struct RolloutCollector {
    backend: Arc<dyn CompletionBackend>,
    sampling: SamplingConfig,
    early_stop: EarlyStopConfig,
}

impl RolloutCollector {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        sampling: SamplingConfig,
        early_stop: EarlyStopConfig,
    ) -> Self {
        Self {
            backend,
            sampling,
            early_stop,
        }
    }

    /// Collect `n` graded candidates per task.
    ///
    /// All per-task work runs inside a `JoinSet` owned by this call: when it
    /// returns (or its future is dropped because the surrounding iteration
    /// was abandoned), every unfinished job is aborted, so no generation
    /// request outlives the call.
    ///
    /// # Errors
    ///
    /// Fails only on a zero-signal round: no gradable samples at all, or no
    /// request with usable token totals. Everything else is absorbed into
    /// the returned [`CollectionStats`].
    pub async fn collect(
        &self,
        tasks: &[Arc<dyn Task>],
        n: usize,
        budget: &Arc<TokenBudget>,
    ) -> Result<(Vec<SampleGroup>, CollectionStats), CollectError> {
        let n = n.max(1);
        let mut jobs = JoinSet::new();
        for task in tasks {
            let job = TaskJob {
                backend: Arc::clone(&self.backend),
                budget: Arc::clone(budget),
                task: Arc::clone(task),
                n,
                sampling: self.sampling.clone(),
                early_stop: self.early_stop.clone(),
            };
            jobs.spawn(job.run());
        }

        let mut groups = Vec::new();
        let mut stats = CollectionStats::default();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(rollout) => {
                    stats.absorb(&rollout.stats);
                    if !rollout.samples.is_empty() {
                        groups.push(SampleGroup {
                            task_id: rollout.task_id,
                            samples: rollout.samples,
                        });
                    }
                }
                Err(error) => {
                    warn!(error = %error, "rollout job died");
                    stats.exceptions += 1;
                }
            }
        }
        groups.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        info!(
            tasks = tasks.len(),
            groups = groups.len(),
            grades = stats.grades,
            usages = stats.usages,
            exceptions = stats.exceptions,
            early_stops = stats.early_stops,
            mean_reward = stats.mean_reward(),
            "collection round complete"
        );

        if stats.grades == 0 {
            return Err(CollectError::NoGradableSamples {
                tasks: tasks.len(),
                exceptions: stats.exceptions,
            });
        }
        if stats.usages == 0 {
            return Err(CollectError::NoUsableUsage {
                tasks: tasks.len(),
                exceptions: stats.exceptions,
            });
        }

        Ok((groups, stats))
    }
}

// ---------------------------------------------------------------------------
// Per-task job
// ---------------------------------------------------------------------------

struct TaskJob {
    backend: Arc<dyn CompletionBackend>,
    budget: Arc<TokenBudget>,
    task: Arc<dyn Task>,
    n: usize,
    sampling: SamplingConfig,
    early_stop: EarlyStopConfig,
}

struct TaskRollout {
    task_id: String,
    samples: Vec<GradedSample>,
    stats: CollectionStats,
}

enum ChoiceKind {
    Graded(GradedSample),
    EarlyStopExcluded,
    Failed,
}

struct ChoiceOutcome {
    kind: ChoiceKind,
    usage_seen: bool,
    metrics: std::collections::HashMap<String, f64>,
}

impl TaskJob {
    /// Run one task's request under a governor permit. The permit covers the
    /// whole request (issue + stream consumption + grading) and is released
    /// when the job finishes, successfully or not.
    async fn run(self) -> TaskRollout {
        let task_id = self.task.id().to_string();
        let mut stats = CollectionStats::default();
        let mut samples = Vec::new();

        let permit = self.budget.acquire(self.n as u32).await;
        let deadline = Duration::from_secs(self.sampling.request_timeout_secs);
        match tokio::time::timeout(deadline, self.consume_request(&mut stats, &mut samples)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(task = %task_id, error = %error, "generation request failed");
                stats.exceptions += 1;
            }
            Err(_) => {
                warn!(
                    task = %task_id,
                    timeout_secs = self.sampling.request_timeout_secs,
                    "generation request timed out"
                );
                stats.exceptions += 1;
            }
        }
        drop(permit);

        samples.sort_by_key(|sample| sample.choice_index);
        TaskRollout {
            task_id,
            samples,
            stats,
        }
    }

    /// Issue the generation request and drain all of its choice streams,
    /// grading candidates as their streams finish.
    async fn consume_request(
        &self,
        stats: &mut CollectionStats,
        samples: &mut Vec<GradedSample>,
    ) -> anyhow::Result<()> {
        let request = GenerationRequest {
            prompt: self.task.prompt().to_string(),
            n: self.n,
            temperature: self.sampling.temperature,
            max_tokens: self.sampling.max_tokens,
            logprobs: self.sampling.logprobs,
        };
        let streams = self.backend.generate(request).await?;

        let mut usage_seen = false;
        let mut choices: FuturesUnordered<_> = streams
            .into_iter()
            .map(|stream| self.consume_choice(stream))
            .collect();

        // Outcomes land in resolution order, not submission order; a slow
        // choice never delays accounting for its finished siblings.
        while let Some(outcome) = choices.next().await {
            usage_seen |= outcome.usage_seen;
            match outcome.kind {
                ChoiceKind::Graded(sample) => {
                    stats.grades += 1;
                    stats.total_reward += sample.reward;
                    stats.completion_tokens += sample.completion_tokens;
                    stats.metrics.add_all(&outcome.metrics);
                    samples.push(sample);
                }
                ChoiceKind::EarlyStopExcluded => stats.early_stops += 1,
                ChoiceKind::Failed => stats.exceptions += 1,
            }
        }

        if usage_seen {
            stats.usages += 1;
        }
        Ok(())
    }

    /// Drain one choice stream, feeding the early-stop monitor on each chunk,
    /// then grade the resulting candidate.
    async fn consume_choice(&self, mut stream: ChoiceStream) -> ChoiceOutcome {
        let choice_index = stream.index;
        let mut monitor = EarlyStopMonitor::new(&self.early_stop);
        let mut text = String::new();
        let mut token_ids = Vec::new();
        let mut logprobs = Vec::new();
        let mut tokens_seen = 0usize;
        let mut missing_ids = 0usize;
        let mut usage = None;
        let mut early_stopped = false;

        while let Some(chunk) = stream.next_chunk().await {
            if let Some(u) = chunk.usage {
                usage = Some(u);
                continue;
            }
            tokens_seen += 1;
            text.push_str(&chunk.text);
            match chunk.token_id {
                Some(id) => token_ids.push(id),
                None => missing_ids += 1,
            }
            if let Some(lp) = chunk.logprob {
                logprobs.push(lp);
            }
            if monitor.observe(chunk.logprob) == Verdict::Stop {
                early_stopped = true;
                stream.close();
                break;
            }
        }

        let usage_seen = usage.is_some();
        let no_metrics = std::collections::HashMap::new();

        if early_stopped && !self.early_stop.grade_truncated {
            debug!(
                task = self.task.id(),
                choice = choice_index,
                tokens = tokens_seen,
                ema = monitor.ema(),
                "early-stopped stream excluded from grading"
            );
            return ChoiceOutcome {
                kind: ChoiceKind::EarlyStopExcluded,
                usage_seen,
                metrics: no_metrics,
            };
        }

        // A stream that ended before producing any usable output was hard
        // cancelled on the backend side; its reward is undefined.
        if tokens_seen == 0 {
            warn!(
                task = self.task.id(),
                choice = choice_index,
                "stream ended without output"
            );
            return ChoiceOutcome {
                kind: ChoiceKind::Failed,
                usage_seen,
                metrics: no_metrics,
            };
        }

        let complete_logprobs =
            missing_ids == 0 && !logprobs.is_empty() && logprobs.len() == token_ids.len();
        let candidate = Candidate {
            text,
            token_ids,
            logprobs: complete_logprobs.then_some(logprobs),
            early_stopped,
        };

        match self.task.grade(&candidate).await {
            Ok(grade) => {
                let completion_tokens = usage
                    .map(|u| u.completion_tokens)
                    .unwrap_or(candidate.token_ids.len() as u64);
                let sample = GradedSample {
                    task_id: self.task.id().to_string(),
                    choice_index,
                    reward: grade.reward,
                    token_ids: candidate.token_ids,
                    logprobs: candidate.logprobs,
                    completion_tokens,
                    early_stopped,
                };
                ChoiceOutcome {
                    kind: ChoiceKind::Graded(sample),
                    usage_seen,
                    metrics: grade.metrics,
                }
            }
            Err(error) => {
                warn!(
                    task = self.task.id(),
                    choice = choice_index,
                    error = %error,
                    "grading failed"
                );
                ChoiceOutcome {
                    kind: ChoiceKind::Failed,
                    usage_seen,
                    metrics: no_metrics,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::config::RunConfig;
    use crate::model::{MockBackend, MockReply, ScriptedChoice};
    use crate::rollout::types::{Grade, KeywordTask};

    fn sampling() -> SamplingConfig {
        SamplingConfig {
            request_timeout_secs: 5,
            ..RunConfig::default().sampling
        }
    }

    fn early_stop() -> EarlyStopConfig {
        RunConfig::default().early_stop
    }

    fn keyword_task(id: &str) -> Arc<dyn Task> {
        Arc::new(KeywordTask::new(id, &format!("prompt for {id}"), vec![1, 2], "42"))
    }

    fn collector(backend: Arc<MockBackend>, early_stop: EarlyStopConfig) -> RolloutCollector {
        RolloutCollector::new(backend, sampling(), early_stop)
    }

    #[tokio::test]
    async fn collects_full_groups_with_stats() {
        let backend = Arc::new(MockBackend::new(4096));
        let collector = collector(Arc::clone(&backend), early_stop());
        let tasks = vec![keyword_task("a"), keyword_task("b")];
        let budget = Arc::new(TokenBudget::new(16));

        let (groups, stats) = collector.collect(&tasks, 4, &budget).await.unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].task_id, "a");
        assert_eq!(groups[0].samples.len(), 4);
        // The default mock reply alternates correct/incorrect by parity.
        assert_eq!(groups[0].rewards(), vec![1.0, 0.0, 1.0, 0.0]);

        assert_eq!(stats.grades, 8);
        assert_eq!(stats.usages, 2);
        assert_eq!(stats.exceptions, 0);
        assert_eq!(stats.early_stops, 0);
        assert!((stats.mean_reward() - 0.5).abs() < 1e-9);
        assert!(stats.metrics.mean("chars").is_some());
    }

    #[tokio::test]
    async fn grading_failure_counts_as_exception_without_aborting_siblings() {
        /// Fails to grade any candidate that admits uncertainty.
        struct PickyTask {
            inner: KeywordTask,
        }

        #[async_trait]
        impl Task for PickyTask {
            fn id(&self) -> &str {
                self.inner.id()
            }
            fn prompt(&self) -> &str {
                self.inner.prompt()
            }
            fn prompt_tokens(&self) -> &[u32] {
                self.inner.prompt_tokens()
            }
            async fn grade(&self, candidate: &Candidate) -> Result<Grade> {
                if candidate.text.contains("not sure") {
                    anyhow::bail!("cannot grade an uncertain answer");
                }
                self.inner.grade(candidate).await
            }
        }

        let backend = Arc::new(MockBackend::new(4096));
        let collector = collector(Arc::clone(&backend), early_stop());
        let tasks: Vec<Arc<dyn Task>> = vec![Arc::new(PickyTask {
            inner: KeywordTask::new("p", "prompt for p", vec![1], "42"),
        })];
        let budget = Arc::new(TokenBudget::new(16));

        let (groups, stats) = collector.collect(&tasks, 2, &budget).await.unwrap();

        // Choice 0 ("...42") graded, choice 1 ("not sure") failed.
        assert_eq!(stats.grades, 1);
        assert_eq!(stats.exceptions, 1);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].samples.len(), 1);
        assert_eq!(groups[0].samples[0].choice_index, 0);
    }

    #[tokio::test]
    async fn request_failure_is_absorbed() {
        let backend = Arc::new(MockBackend::new(4096));
        backend.script("prompt for a", MockReply::Failure("503".into()));
        let collector = collector(Arc::clone(&backend), early_stop());
        let tasks = vec![keyword_task("a"), keyword_task("b")];
        let budget = Arc::new(TokenBudget::new(16));

        let (groups, stats) = collector.collect(&tasks, 2, &budget).await.unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].task_id, "b");
        assert_eq!(stats.exceptions, 1);
        assert_eq!(stats.grades, 2);
        assert_eq!(stats.usages, 1);
    }

    #[tokio::test]
    async fn zero_gradable_samples_is_fatal() {
        struct HopelessTask(KeywordTask);

        #[async_trait]
        impl Task for HopelessTask {
            fn id(&self) -> &str {
                self.0.id()
            }
            fn prompt(&self) -> &str {
                self.0.prompt()
            }
            fn prompt_tokens(&self) -> &[u32] {
                self.0.prompt_tokens()
            }
            async fn grade(&self, _candidate: &Candidate) -> Result<Grade> {
                anyhow::bail!("grader offline")
            }
        }

        let backend = Arc::new(MockBackend::new(4096));
        let collector = collector(Arc::clone(&backend), early_stop());
        let tasks: Vec<Arc<dyn Task>> = vec![Arc::new(HopelessTask(KeywordTask::new(
            "h",
            "prompt for h",
            vec![1],
            "42",
        )))];
        let budget = Arc::new(TokenBudget::new(16));

        let error = collector.collect(&tasks, 2, &budget).await.unwrap_err();
        assert!(matches!(error, CollectError::NoGradableSamples { .. }));
    }

    #[tokio::test]
    async fn missing_usage_totals_are_fatal() {
        let backend = Arc::new(MockBackend::new(4096));
        let mut choice = ScriptedChoice::from_text("the answer is 42", -0.5);
        choice.include_usage = false;
        backend.script("prompt for a", MockReply::Choices(vec![choice]));

        let collector = collector(Arc::clone(&backend), early_stop());
        let tasks = vec![keyword_task("a")];
        let budget = Arc::new(TokenBudget::new(16));

        let error = collector.collect(&tasks, 1, &budget).await.unwrap_err();
        assert!(matches!(error, CollectError::NoUsableUsage { .. }));
    }

    #[tokio::test]
    async fn early_stop_is_excluded_not_failed() {
        let backend = Arc::new(MockBackend::new(4096));
        backend.script(
            "prompt for a",
            MockReply::Choices(vec![
                ScriptedChoice::filler(200, -5.0),
                ScriptedChoice::from_text("the answer is 42", -0.5),
            ]),
        );

        let config = EarlyStopConfig {
            min_tokens: 4,
            ..early_stop()
        };
        let collector = collector(Arc::clone(&backend), config);
        let tasks = vec![keyword_task("a")];
        let budget = Arc::new(TokenBudget::new(16));

        let (groups, stats) = collector.collect(&tasks, 2, &budget).await.unwrap();

        assert_eq!(stats.early_stops, 1);
        assert_eq!(stats.exceptions, 0);
        assert_eq!(stats.grades, 1);
        assert_eq!(groups[0].samples.len(), 1);
        assert_eq!(groups[0].samples[0].choice_index, 1);
    }

    #[tokio::test]
    async fn early_stop_grades_truncated_candidate_when_configured() {
        let backend = Arc::new(MockBackend::new(4096));
        backend.script(
            "prompt for a",
            MockReply::Choices(vec![
                ScriptedChoice::filler(200, -5.0),
                ScriptedChoice::from_text("the answer is 42", -0.5),
            ]),
        );

        let config = EarlyStopConfig {
            min_tokens: 4,
            grade_truncated: true,
            ..early_stop()
        };
        let collector = collector(Arc::clone(&backend), config);
        let tasks = vec![keyword_task("a")];
        let budget = Arc::new(TokenBudget::new(16));

        let (groups, stats) = collector.collect(&tasks, 2, &budget).await.unwrap();

        assert_eq!(stats.early_stops, 0);
        assert_eq!(stats.grades, 2);

        let truncated = &groups[0].samples[0];
        assert!(truncated.early_stopped);
        // The monitor fired at the minimum-token floor; consumption stopped
        // far short of the scripted 200 tokens.
        assert_eq!(truncated.token_ids.len(), 4);
        assert!((truncated.reward).abs() < 1e-9);
    }

    #[tokio::test]
    async fn tiny_budget_still_completes_every_task() {
        let backend = Arc::new(MockBackend::new(4096));
        let collector = collector(Arc::clone(&backend), early_stop());
        let tasks: Vec<Arc<dyn Task>> = (0..4)
            .map(|i| keyword_task(&format!("t{i}")))
            .collect();
        let budget = Arc::new(TokenBudget::new(1));

        let (groups, stats) = collector.collect(&tasks, 2, &budget).await.unwrap();

        assert_eq!(groups.len(), 4);
        assert_eq!(stats.grades, 8);
        assert_eq!(budget.available(), 1);
    }
}
