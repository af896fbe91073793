//! Capacity planning and batch scheduling for order admission.
//!
//! Given an admitted order, the scheduler decides how many tasks to
//! split it into and when each task should become eligible for
//! dispatch. Both are pure functions of the order's quantity and a
//! caller-supplied jitter source; no I/O happens here.

pub mod capacity;

pub use capacity::{check_admission, plan_batches, BatchPlan, CapacityError};
