//! Bounded cache of live schedulers, keyed by instance id.
//!
//! A cached engine lets the next task for the same instance skip replay.
//! Entries are taken out while a task runs and put back afterwards, so an
//! engine is never shared between two tasks.

use moka::sync::Cache;
use std::sync::{Arc, Mutex, PoisonError};

pub(crate) struct ExecutorCache<V: Send + 'static> {
    /// `None` when caching is disabled.
    entries: Option<Cache<String, Arc<Mutex<V>>>>,
}

impl<V: Send + 'static> ExecutorCache<V> {
    pub(crate) fn new(capacity: usize) -> Self {
        let entries = (capacity > 0).then(|| Cache::builder().max_capacity(capacity as u64).build());
        Self { entries }
    }

    pub(crate) fn take(&self, key: &str) -> Option<V> {
        let entry = self.entries.as_ref()?.remove(key)?;
        let engine = Arc::try_unwrap(entry).ok()?;
        Some(engine.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn insert(&self, key: String, value: V) {
        if let Some(entries) = &self.entries {
            entries.insert(key, Arc::new(Mutex::new(value)));
        }
    }

    pub(crate) fn remove(&self, key: &str) {
        if let Some(entries) = &self.entries {
            entries.invalidate(key);
        }
    }

    /// Approximate; pending evictions may not be applied yet.
    pub(crate) fn len(&self) -> u64 {
        self.entries.as_ref().map_or(0, |entries| entries.entry_count())
    }
}
