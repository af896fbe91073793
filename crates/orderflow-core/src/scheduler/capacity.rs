//! Capacity planner: batch-count sizing, per-batch quantity split, and
//! delivery-window spreading.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use thiserror::Error;

/// The unit size used to cap how many tasks a single order is split
/// into. Orders above the small-order threshold get one task per this
/// many units, up to `ceiling` tasks.
const BATCH_UNIT: i32 = 400;

/// Orders at or below this quantity are never split; they run as a
/// single task.
const SMALL_ORDER_THRESHOLD: i32 = 1000;

/// Default delivery window, in hours, before jitter is applied.
pub const DEFAULT_WINDOW_HOURS: f64 = 48.0;

/// Hard ceiling on the delivery window, in hours, regardless of
/// jitter.
pub const WINDOW_CEILING_HOURS: f64 = 72.0;

/// Fractional jitter applied to the window and to each task's offset
/// within it.
pub const WINDOW_JITTER_FRACTION: f64 = 0.05;

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(i32),
    #[error("batch ceiling must be positive, got {0}")]
    NonPositiveCeiling(i32),
    #[error("order rejected: requested {requested} units but only {available} available (deficit {deficit})")]
    Rejected {
        requested: i64,
        available: i64,
        deficit: i64,
    },
}

/// One planned task within an order's batch split.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    pub sequence: i32,
    pub quantity: i32,
    pub scheduled_at: DateTime<Utc>,
}

/// Number of tasks to split `quantity` into, capped at `ceiling`.
///
/// Orders of `quantity <= 1000` are never split (`K = 1`). Larger orders
/// get `K = min(ceil(quantity / 400), ceiling)`.
pub fn batch_count(quantity: i32, ceiling: i32) -> Result<i32, CapacityError> {
    if quantity <= 0 {
        return Err(CapacityError::NonPositiveQuantity(quantity));
    }
    if ceiling <= 0 {
        return Err(CapacityError::NonPositiveCeiling(ceiling));
    }

    if quantity <= SMALL_ORDER_THRESHOLD {
        return Ok(1);
    }

    let by_unit = (quantity + BATCH_UNIT - 1) / BATCH_UNIT;
    Ok(by_unit.min(ceiling))
}

/// Split `quantity` into `batches` near-equal parts, each at least 1,
/// with any remainder distributed to the earliest batches.
pub fn split_quantity(quantity: i32, batches: i32) -> Vec<i32> {
    let base = quantity / batches;
    let remainder = quantity % batches;
    (0..batches)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Plan the batch split for an order: how many tasks, what quantity
/// each carries, and when each becomes eligible for dispatch.
///
/// The window is `DEFAULT_WINDOW_HOURS` jittered by
/// `WINDOW_JITTER_FRACTION`, capped at `WINDOW_CEILING_HOURS`. Tasks are
/// spread evenly across the window, each with its own small jitter, so
/// delivery does not arrive in one burst.
pub fn plan_batches(
    quantity: i32,
    ceiling: i32,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> Result<Vec<BatchPlan>, CapacityError> {
    let count = batch_count(quantity, ceiling)?;
    let quantities = split_quantity(quantity, count);

    let window_hours = jittered(DEFAULT_WINDOW_HOURS, WINDOW_JITTER_FRACTION, rng)
        .min(WINDOW_CEILING_HOURS);

    let plans = quantities
        .into_iter()
        .enumerate()
        .map(|(i, qty)| {
            let fraction = if count <= 1 {
                0.0
            } else {
                i as f64 / (count - 1) as f64
            };
            let offset_hours = jittered(fraction * window_hours, WINDOW_JITTER_FRACTION, rng)
                .clamp(0.0, window_hours);
            let scheduled_at = now + ChronoDuration::milliseconds((offset_hours * 3_600_000.0) as i64);
            BatchPlan {
                sequence: i as i32,
                quantity: qty,
                scheduled_at,
            }
        })
        .collect();

    Ok(plans)
}

fn jittered(value: f64, fraction: f64, rng: &mut impl Rng) -> f64 {
    if value == 0.0 {
        return 0.0;
    }
    let delta = value * fraction;
    value + rng.random_range(-delta..=delta)
}

/// Result of evaluating whether a requested quantity fits within
/// remaining throughput capacity over a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub available: i64,
    pub requested: i64,
    pub deficit: i64,
}

impl AdmissionDecision {
    pub fn is_fully_admitted(&self) -> bool {
        self.deficit == 0
    }
}

/// Evaluate admission and turn a deficit into the `Rejected` error kind
/// callers are expected to surface to the order submitter.
pub fn check_admission(
    hourly_rate: i64,
    window_hours: f64,
    already_committed: i64,
    requested: i64,
) -> Result<AdmissionDecision, CapacityError> {
    let decision = evaluate_admission(hourly_rate, window_hours, already_committed, requested);
    if decision.is_fully_admitted() {
        Ok(decision)
    } else {
        Err(CapacityError::Rejected {
            requested: decision.requested,
            available: decision.available,
            deficit: decision.deficit,
        })
    }
}

/// Evaluate whether `requested` units can be admitted given a rolling
/// throughput budget of `hourly_rate` units/hour over `window_hours`,
/// net of `already_committed` units already promised to other orders.
pub fn evaluate_admission(
    hourly_rate: i64,
    window_hours: f64,
    already_committed: i64,
    requested: i64,
) -> AdmissionDecision {
    let total_budget = (hourly_rate as f64 * window_hours) as i64;
    let available = (total_budget - already_committed).max(0);
    let deficit = (requested - available).max(0);
    AdmissionDecision {
        available,
        requested,
        deficit,
    }
}
