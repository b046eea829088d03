//! Early-stop monitor for degenerate generations.
//!
//! Tracks an exponential moving average of per-token log-probability for one
//! stream and signals cancellation once the average sinks below a threshold:
//! a model that has wandered into low-confidence territory rarely recovers,
//! and every further token costs inference capacity. The verdict is advisory;
//! the collector decides what to do with the truncated candidate.

use crate::config::EarlyStopConfig;

/// The monitor's per-chunk verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep consuming the stream.
    Continue,
    /// Abandon the stream.
    Stop,
}

/// Per-stream EMA detector. Invoked synchronously on each chunk arrival;
/// never blocks.
#[derive(Debug, Clone)]
pub struct EarlyStopMonitor {
    alpha: f64,
    threshold: f64,
    min_tokens: usize,
    ema: Option<f64>,
    observed: usize,
}

impl EarlyStopMonitor {
    pub fn new(config: &EarlyStopConfig) -> Self {
        Self {
            alpha: config.alpha,
            threshold: config.threshold,
            min_tokens: config.min_tokens,
            ema: None,
            observed: 0,
        }
    }

    /// Feed one token's log-probability (if the backend reported one) and
    /// decide whether the stream is still worth its cost.
    ///
    /// The EMA is seeded with the first observed value and decayed as
    /// `ema = alpha * ema + (1 - alpha) * lp`. Tokens without a
    /// log-probability advance the token count but leave the average
    /// untouched. The monitor never triggers before `min_tokens` tokens have
    /// been seen.
    pub fn observe(&mut self, logprob: Option<f64>) -> Verdict {
        self.observed += 1;
        if let Some(lp) = logprob {
            self.ema = Some(match self.ema {
                Some(ema) => self.alpha * ema + (1.0 - self.alpha) * lp,
                None => lp,
            });
        }

        match self.ema {
            Some(ema) if self.observed >= self.min_tokens && ema < self.threshold => Verdict::Stop,
            _ => Verdict::Continue,
        }
    }

    /// The current moving average, if any token carried a log-probability.
    pub fn ema(&self) -> Option<f64> {
        self.ema
    }
}
