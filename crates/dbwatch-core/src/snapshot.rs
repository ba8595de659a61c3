//! Snapshot store: last raw value seen for every counter key.
//!
//! Keys are partitioned by source (the job name), so two jobs never write the
//! same key. A single coarse mutex is enough; it is never held across an
//! await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

/// Identity of one counter series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub source: String,
    pub entity_key: String,
    pub metric_name: String,
}

impl SnapshotKey {
    pub fn new(
        source: impl Into<String>,
        entity_key: impl Into<String>,
        metric_name: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            entity_key: entity_key.into(),
            metric_name: metric_name.into(),
        }
    }
}

/// Last known raw value for a key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotEntry {
    pub raw_value: f64,
    pub captured_at: DateTime<Utc>,
}

/// Process-lifetime cache of [`SnapshotEntry`] values.
///
/// Cheap to clone; clones share the same map. Never persisted: a fresh
/// process starts empty and the first sample of every key is silent.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    inner: Arc<Mutex<HashMap<SnapshotKey, SnapshotEntry>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SnapshotKey, SnapshotEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &SnapshotKey) -> Option<SnapshotEntry> {
        self.lock().get(key).copied()
    }

    /// Stores `entry`, returning the previous entry for the key.
    pub fn insert(&self, key: SnapshotKey, entry: SnapshotEntry) -> Option<SnapshotEntry> {
        self.lock().insert(key, entry)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of keys owned by `source`.
    pub fn source_len(&self, source: &str) -> usize {
        self.lock().keys().filter(|k| k.source == source).count()
    }

    /// Drops every key of `source` whose last sample is older than `cutoff`.
    ///
    /// Entities that disappear (dropped tables, evicted statements) would
    /// otherwise stay in memory forever. Returns the number of evicted keys.
    pub fn evict_stale(&self, source: &str, cutoff: DateTime<Utc>) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|k, e| k.source != source || e.captured_at >= cutoff);
        before - map.len()
    }

    /// Drops all keys of `source`.
    pub fn forget_source(&self, source: &str) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|k, _| k.source != source);
        before - map.len()
    }
}
