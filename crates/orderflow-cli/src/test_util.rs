//! Shared test helpers.

use std::sync::{Mutex, MutexGuard};

/// Tests that mutate process environment variables race against each
/// other under the default parallel test runner; serialize them on this
/// mutex.
static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
