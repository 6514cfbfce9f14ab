use anyhow::Result;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Locks a mutex, reporting poisoning as an error instead of panicking.
pub fn lock_mutex<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| anyhow::anyhow!("Mutex poisoned: {}", e))
}

/// Locks a mutex, taking the guard back from a poisoned lock. Only for data
/// that stays consistent when a holder panics mid-update.
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Recovering poisoned mutex");
        poisoned.into_inner()
    })
}

/// Shortens a session uuid for log lines and listings.
pub fn short_uuid(uuid: &str) -> &str {
    uuid.get(..8).unwrap_or(uuid)
}
