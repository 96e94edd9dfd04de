//! Lock-free accounting of ongoing completion cost.

use std::sync::atomic::{AtomicI64, Ordering};

/// Fixed-point scale: nine decimal places of cost precision.
const TICKS_PER_UNIT: f64 = 1_000_000_000.0;

/// Shared accumulator for the cost accrued across all connectors in a
/// logical run.
///
/// Sits on the hot path of every dispatch, so all operations are single
/// atomic instructions on a fixed-point integer; no floating-point drift
/// under concurrent increments and no mutex. Reads are linearizable: the
/// returned value was true at some instant.
#[derive(Debug, Default)]
pub struct CostCreditor {
    ongoing_cost_ticks: AtomicI64,
}

impl CostCreditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current accrued cost.
    pub fn ongoing_cost(&self) -> f64 {
        self.ongoing_cost_ticks.load(Ordering::SeqCst) as f64 / TICKS_PER_UNIT
    }

    /// Adds `cost` to the ledger.
    pub fn credit(&self, cost: f64) {
        let ticks = (cost * TICKS_PER_UNIT).round() as i64;
        self.ongoing_cost_ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Resets the ledger to zero, returning the cost accrued so far.
    pub fn reset(&self) -> f64 {
        self.ongoing_cost_ticks.swap(0, Ordering::SeqCst) as f64 / TICKS_PER_UNIT
    }
}
