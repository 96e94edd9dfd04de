//! Per prompt-type, per-connector performance records and connector
//! comparison.

use crate::job::CompletionJob;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Degree of trust earned by a connector for a given prompt type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum VettingLevel {
    /// Connector was evaluated and judged incorrect.
    Invalid = -1,
    /// No vetting was performed yet.
    #[default]
    None = 0,
    /// Judged correct by the trusted connector on test results from one
    /// prompt.
    Oracle = 1,
    /// Judged correct by the trusted connector on test results from distinct
    /// prompts.
    OracleVaried = 2,
}

impl VettingLevel {
    /// Whether this level makes the connector selectable for dispatch.
    pub fn is_vetted(self) -> bool {
        self > VettingLevel::None
    }
}

/// Recorded performance of one connector against one prompt type.
///
/// Mutated only by the analysis pipeline's suggestion stage, or by a vetting
/// reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorPerformance {
    pub vetting_level: VettingLevel,
    pub average_duration: Duration,
    pub average_cost: f64,
    pub sample_count: u32,
}

impl ConnectorPerformance {
    /// Folds one more measured (duration, cost) pair into the running
    /// averages.
    pub fn record_measurement(&mut self, duration: Duration, cost: f64) {
        let previous = self.sample_count as f64;
        let next = previous + 1.0;
        self.average_duration = Duration::from_secs_f64(
            (self.average_duration.as_secs_f64() * previous + duration.as_secs_f64()) / next,
        );
        self.average_cost = (self.average_cost * previous + cost) / next;
        self.sample_count += 1;
    }
}

/// Comparator used to rank eligible connectors for a job; `Ordering::Less`
/// means the first connector is preferred.
pub type ConnectorComparator = Arc<
    dyn Fn(&CompletionJob, &ConnectorPerformance, &ConnectorPerformance) -> Ordering
        + Send
        + Sync,
>;

/// Relative tolerance within which two blended ratios count as a tie.
const COMPARATOR_EPSILON: f64 = 0.01;

/// Builds the default comparator: a weighted average of the relative cost
/// and duration improvement ratios between two connectors.
///
/// A dimension only participates when both connectors have a non-zero
/// recorded value for it; otherwise it contributes a neutral 1.0. The
/// blended ratio is compared against 1.0 with a small epsilon for tie
/// detection, so a connector with no recorded cost never divides by zero and
/// never wins on the cost dimension alone.
pub fn weighted_comparator(duration_weight: f64, cost_weight: f64) -> ConnectorComparator {
    Arc::new(move |_job, first, second| {
        let weight_sum = duration_weight + cost_weight;
        if weight_sum == 0.0 {
            return Ordering::Equal;
        }

        let duration_ratio = if first.average_duration > Duration::ZERO
            && second.average_duration > Duration::ZERO
        {
            second.average_duration.as_secs_f64() / first.average_duration.as_secs_f64()
        } else {
            1.0
        };
        let cost_ratio = if first.average_cost > 0.0 && second.average_cost > 0.0 {
            second.average_cost / first.average_cost
        } else {
            1.0
        };

        let blended = (cost_weight * cost_ratio + duration_weight * duration_ratio) / weight_sum;
        if (blended - 1.0).abs() < COMPARATOR_EPSILON {
            Ordering::Equal
        } else if blended > 1.0 {
            // The second connector is costlier/slower: the first is better.
            Ordering::Less
        } else {
            Ordering::Greater
        }
    })
}
