//! Weighted aggregation of task outcomes into one 0-100 score.
//!
//! Only successful outcomes contribute; failures are excluded rather than
//! counted as zero. Arithmetic is done in integers so `.5` ties always
//! round up regardless of float representation.

use std::collections::BTreeMap;

use crate::domain::{TaskOutcome, TaskType};

use super::registry::WeightTable;

/// Combine outcomes into a single score.
///
/// Returns 0 when no task succeeded.
pub fn aggregate(outcomes: &BTreeMap<TaskType, TaskOutcome>, weights: &WeightTable) -> u8 {
    let mut weighted_sum: u64 = 0;
    let mut total_weight: u64 = 0;

    for (task, outcome) in outcomes {
        if let Some(score) = outcome.score() {
            let weight = weights.weight_for(*task) as u64;
            weighted_sum += weight * score.min(100) as u64;
            total_weight += weight;
        }
    }

    if total_weight == 0 {
        return 0;
    }

    // floor(sum / total + 1/2) == floor((2 * sum + total) / (2 * total))
    let rounded = (2 * weighted_sum + total_weight) / (2 * total_weight);
    rounded.min(100) as u8
}
