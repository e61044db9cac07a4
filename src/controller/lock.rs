//! Per-application mutual exclusion
//!
//! One async mutex per `{namespace}-{app}` key. Entries are created on first
//! use under the registry's own lock and never removed, so two callers racing
//! on a new key always end up with the same mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

#[derive(Default)]
pub struct AppLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            // The map is never left half-updated, so a poisoned lock is still usable
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`; released when the guard drops
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.entry(key);
        debug!(key = %key, "Waiting for application lock");
        let guard = lock.lock_owned().await;
        debug!(key = %key, "Acquired application lock");
        guard
    }

    /// Number of keys ever locked
    pub fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
