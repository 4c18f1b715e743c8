//! Per-key mutual exclusion.
//!
//! Mutations of one run are serialized on that run's lock; group membership
//! changes are serialized on the study's lock. When both are needed the study
//! lock is taken first.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use publix_kernel::{RunId, StudyId};

use crate::error::PublixError;

/// Registry of lazily created locks, one per key.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    name: &'static str,
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Copy + std::fmt::Display> KeyedLocks<K> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: K) -> Result<Arc<Mutex<()>>, PublixError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| PublixError::Internal(format!("{} lock registry: {}", self.name, e)))?;
        Ok(slots.entry(key).or_default().clone())
    }

    /// Drops the slot for `key` once nobody else holds or waits on it. Clones
    /// are only handed out under the registry lock, so the count is stable
    /// while it is held.
    fn release(&self, key: K, slot: Arc<Mutex<()>>) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let idle = slots
            .get(&key)
            .is_some_and(|held| Arc::ptr_eq(held, &slot) && Arc::strong_count(&slot) == 2);
        if idle {
            slots.remove(&key);
        }
    }

    /// Runs `f` while holding the lock for `key`.
    pub fn with<T>(
        &self,
        key: K,
        f: impl FnOnce() -> Result<T, PublixError>,
    ) -> Result<T, PublixError> {
        let slot = self.slot(key)?;
        let result = match slot.lock() {
            Ok(_guard) => f(),
            Err(_) => Err(PublixError::Internal(format!(
                "{} lock {} poisoned",
                self.name, key
            ))),
        };
        self.release(key, slot);
        result
    }

    /// Number of keys with a live slot.
    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The two lock families the engine uses.
#[derive(Debug)]
pub struct EngineLocks {
    pub runs: KeyedLocks<RunId>,
    pub studies: KeyedLocks<StudyId>,
}

impl EngineLocks {
    pub fn new() -> Self {
        Self {
            runs: KeyedLocks::new("run"),
            studies: KeyedLocks::new("study"),
        }
    }
}

impl Default for EngineLocks {
    fn default() -> Self {
        Self::new()
    }
}
