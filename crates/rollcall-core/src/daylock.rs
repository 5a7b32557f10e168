//! Per-day mutual exclusion for the file-backed day segments.
//!
//! Serialises read-decide-append within one process. Cross-process exclusion
//! is added on top with an advisory lock on the segment file itself.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub(crate) struct DayLocks {
    locks: Mutex<HashMap<NaiveDate, Arc<Mutex<()>>>>,
}

impl DayLocks {
    /// Lock handle for `day`, created on first use.
    ///
    /// Entries for other days that no caller holds are dropped.
    pub(crate) fn for_day(&self, day: NaiveDate) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|d, lock| *d == day || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(day).or_default())
    }
}

/// Acquire a day lock. The guarded value is `()`, so poisoning is ignored.
pub(crate) fn acquire(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
