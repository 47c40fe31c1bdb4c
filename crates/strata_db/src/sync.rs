//! Lock helper shared by the caches and statistics counters.

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the data if a previous holder panicked.
///
/// The guarded maps and counters stay structurally valid across a panic, so
/// poisoning carries no information worth surfacing to callers.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
