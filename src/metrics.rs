//! Metrics accumulation and the metrics-sink capability.
//!
//! Graders attach arbitrary named metrics to every grade; the collector folds
//! them into a [`MetricsAccumulator`] (a pure name -> (sum, count) reduction,
//! merged by key). Once per iteration the loop flattens everything into a
//! `name -> value` map and hands it to a [`MetricsSink`]. The bundled
//! [`JsonlMetricsSink`] appends one JSON record per iteration and doubles as
//! the [`RewardHistory`] used to pick the best checkpoint to retain.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Metric key under which the loop logs mean validation reward. The reward
/// history scans for this key when selecting the best iteration.
pub const VAL_REWARD_KEY: &str = "val/mean_reward";

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Running sums and counts for dynamically named metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsAccumulator {
    sums: HashMap<String, f64>,
    counts: HashMap<String, u64>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation of `name`. Unknown keys are added dynamically.
    pub fn add(&mut self, name: &str, value: f64) {
        *self.sums.entry(name.to_string()).or_default() += value;
        *self.counts.entry(name.to_string()).or_default() += 1;
    }

    /// Fold every observation from a `name -> value` map in.
    pub fn add_all(&mut self, metrics: &HashMap<String, f64>) {
        for (name, value) in metrics {
            self.add(name, *value);
        }
    }

    /// Merge another accumulator into this one, key by key.
    pub fn merge(&mut self, other: &MetricsAccumulator) {
        for (name, sum) in &other.sums {
            *self.sums.entry(name.clone()).or_default() += sum;
        }
        for (name, count) in &other.counts {
            *self.counts.entry(name.clone()).or_default() += count;
        }
    }

    /// Mean of all observations of `name`, if any were recorded.
    pub fn mean(&self, name: &str) -> Option<f64> {
        let count = *self.counts.get(name)? as f64;
        Some(self.sums.get(name)? / count)
    }

    /// Per-key means for every recorded metric.
    pub fn means(&self) -> HashMap<String, f64> {
        self.counts
            .keys()
            .filter_map(|name| Some((name.clone(), self.mean(name)?)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Receives the flat per-iteration metrics mapping.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn log_iteration(&self, iteration: u64, metrics: &HashMap<String, f64>) -> Result<()>;
}

/// Answers "which logged iteration had the best validation reward so far".
///
/// The loop only needs the resulting integer; any tracking backend can
/// implement this.
#[async_trait]
pub trait RewardHistory: Send + Sync {
    async fn best_iteration(&self) -> Result<Option<u64>>;
}

// ---------------------------------------------------------------------------
// JSONL sink
// ---------------------------------------------------------------------------

/// One appended record per iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub logged_at: DateTime<Utc>,
    pub iteration: u64,
    pub metrics: HashMap<String, f64>,
}

/// File-backed metrics sink: one JSON object per line in `metrics.jsonl`
/// under the run output root.
#[derive(Debug, Clone)]
pub struct JsonlMetricsSink {
    path: PathBuf,
}

impl JsonlMetricsSink {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join("metrics.jsonl"),
        }
    }

    /// Read every record currently on disk. A missing file is an empty
    /// history, not an error.
    pub fn records(&self) -> Result<Vec<MetricsRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to open {}", self.path.display()))
            }
        };

        let mut records = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = line.context("failed to read metrics record")?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(
                serde_json::from_str(&line)
                    .with_context(|| format!("malformed metrics record: {line}"))?,
            );
        }
        Ok(records)
    }
}

#[async_trait]
impl MetricsSink for JsonlMetricsSink {
    async fn log_iteration(&self, iteration: u64, metrics: &HashMap<String, f64>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let record = MetricsRecord {
            logged_at: Utc::now(),
            iteration,
            metrics: metrics.clone(),
        };
        let line = serde_json::to_string(&record).context("failed to encode metrics record")?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}").context("failed to append metrics record")?;
        Ok(())
    }
}

#[async_trait]
impl RewardHistory for JsonlMetricsSink {
    /// Best iteration by logged validation reward; ties go to the later
    /// iteration.
    async fn best_iteration(&self) -> Result<Option<u64>> {
        let best = self
            .records()?
            .into_iter()
            .filter_map(|record| {
                let reward = *record.metrics.get(VAL_REWARD_KEY)?;
                Some((OrderedFloat(reward), record.iteration))
            })
            .max()
            .map(|(_, iteration)| iteration);
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_merges_by_key() {
        let mut a = MetricsAccumulator::new();
        a.add("reward", 1.0);
        a.add("reward", 0.0);
        a.add("steps", 4.0);

        let mut b = MetricsAccumulator::new();
        b.add("reward", 0.5);
        b.add("novel", 2.0);

        a.merge(&b);
        assert!((a.mean("reward").unwrap() - 0.5).abs() < 1e-9);
        assert!((a.mean("steps").unwrap() - 4.0).abs() < 1e-9);
        assert!((a.mean("novel").unwrap() - 2.0).abs() < 1e-9);
        assert!(a.mean("missing").is_none());
    }

    #[test]
    fn means_covers_every_key() {
        let mut acc = MetricsAccumulator::new();
        acc.add("a", 1.0);
        acc.add("a", 3.0);
        acc.add("b", 10.0);

        let means = acc.means();
        assert_eq!(means.len(), 2);
        assert!((means["a"] - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn jsonl_sink_roundtrips_records() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlMetricsSink::new(dir.path());

        let mut metrics = HashMap::new();
        metrics.insert(VAL_REWARD_KEY.to_string(), 0.25);
        sink.log_iteration(1, &metrics).await.unwrap();

        metrics.insert(VAL_REWARD_KEY.to_string(), 0.75);
        sink.log_iteration(2, &metrics).await.unwrap();

        let records = sink.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].iteration, 2);
    }

    #[tokio::test]
    async fn best_iteration_prefers_later_on_ties() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlMetricsSink::new(dir.path());

        for (iteration, reward) in [(1, 0.5), (2, 0.9), (3, 0.9), (4, 0.1)] {
            let mut metrics = HashMap::new();
            metrics.insert(VAL_REWARD_KEY.to_string(), reward);
            sink.log_iteration(iteration, &metrics).await.unwrap();
        }

        assert_eq!(sink.best_iteration().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn best_iteration_on_empty_history_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlMetricsSink::new(dir.path());
        assert_eq!(sink.best_iteration().await.unwrap(), None);
    }
}
