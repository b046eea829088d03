//! Token-budget rate governor.
//!
//! Bounds total in-flight generation work so the inference server's token
//! capacity is saturated but not oversubscribed. The budget counts
//! expected-size completion slots: a request for `n` choices costs `n` units,
//! and the number of units is derived from the backend's advertised token
//! capacity divided by the calibrated expected completion length. Acquisition
//! order is FIFO (the underlying semaphore is fair), so no caller starves.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A counting budget over concurrent expected-size completions.
#[derive(Debug)]
pub struct TokenBudget {
    semaphore: Arc<Semaphore>,
    budget: u32,
}

/// RAII guard for acquired budget units; dropping it returns exactly the
/// acquired amount.
#[derive(Debug)]
pub struct BudgetPermit {
    _permit: OwnedSemaphorePermit,
}

impl TokenBudget {
    /// Create a budget of `units` slots (at least one).
    pub fn new(units: u32) -> Self {
        let budget = units.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(budget as usize)),
            budget,
        }
    }

    /// Size a budget as `floor(headroom * capacity / expected_completion_tokens)`.
    ///
    /// `headroom` > 1 keeps the backend saturated while completions finish at
    /// different times; `expected_completion_tokens` is recalibrated every
    /// iteration from the previous iteration's observed average, which makes
    /// the governor self-tuning rather than a fixed constant.
    pub fn sized_for(capacity: u64, expected_completion_tokens: u64, headroom: f64) -> Self {
        let expected = expected_completion_tokens.max(1) as f64;
        let units = (headroom * capacity as f64 / expected).floor();
        Self::new(units.clamp(1.0, u32::MAX as f64) as u32)
    }

    /// Wait until `cost` units are available, then take them. Costs above the
    /// total budget are clamped to it, degrading that request to serial
    /// admission instead of deadlocking.
    pub async fn acquire(&self, cost: u32) -> BudgetPermit {
        let cost = cost.clamp(1, self.budget);
        let permit = Arc::clone(&self.semaphore)
            .acquire_many_owned(cost)
            .await
            .expect("budget semaphore closed");
        BudgetPermit { _permit: permit }
    }

    /// Units currently available (for logging and tests).
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// The configured total budget.
    pub fn budget(&self) -> u32 {
        self.budget
    }
}
