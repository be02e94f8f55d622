//! Export statistics
//!
//! Thread-safe, session-scoped counters per destination key. Nothing here is
//! persisted; counts start at zero every process start.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ix_common::{StatsCollector, DEFAULT_INDEX_KEYS};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

#[derive(Debug)]
struct PerIndexStats {
    success_count: AtomicU64,
    failure_count: AtomicU64,
    /// -1 until the first push is recorded
    last_push_duration_ms: AtomicI64,
    last_success_at: Mutex<Option<DateTime<Utc>>>,
}

impl Default for PerIndexStats {
    fn default() -> Self {
        Self {
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            last_push_duration_ms: AtomicI64::new(-1),
            last_success_at: Mutex::new(None),
        }
    }
}

/// Point-in-time view of one destination, for the monitoring endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatsSnapshot {
    pub index_key: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_push_duration_ms: i64,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Per-destination export counters
pub struct ExportStats {
    index_keys: Vec<String>,
    stats: DashMap<String, PerIndexStats>,
}

impl ExportStats {
    pub fn new<I, S>(index_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let index_keys: Vec<String> = index_keys.into_iter().map(Into::into).collect();
        let stats = DashMap::new();
        for key in &index_keys {
            stats.insert(key.clone(), PerIndexStats::default());
        }
        Self { index_keys, stats }
    }

    /// Stats for the standard destinations: traffic, tool, settings, sitemap, findings
    pub fn with_default_keys() -> Self {
        Self::new(DEFAULT_INDEX_KEYS)
    }

    fn update(&self, index_key: &str, f: impl FnOnce(&PerIndexStats)) {
        if let Some(entry) = self.stats.get(index_key) {
            f(entry.value());
            return;
        }
        debug!(index_key = %index_key, "Tracking stats for unconfigured index key");
        let entry = self.stats.entry(index_key.to_string()).or_default();
        f(entry.value());
    }

    fn read<R>(&self, index_key: &str, f: impl FnOnce(&PerIndexStats) -> R) -> Option<R> {
        self.stats.get(index_key).map(|entry| f(entry.value()))
    }

    pub fn record_success(&self, index_key: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.update(index_key, |s| {
            s.success_count.fetch_add(count, Ordering::Relaxed);
            *s.last_success_at.lock() = Some(Utc::now());
        });
    }

    pub fn record_failure(&self, index_key: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.update(index_key, |s| {
            s.failure_count.fetch_add(count, Ordering::Relaxed);
        });
    }

    /// Duration of the most recent push for `index_key`
    pub fn record_last_push(&self, index_key: &str, duration: Duration) {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.update(index_key, |s| {
            s.last_push_duration_ms.store(millis, Ordering::Relaxed);
        });
    }

    pub fn success_count(&self, index_key: &str) -> u64 {
        self.read(index_key, |s| s.success_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn failure_count(&self, index_key: &str) -> u64 {
        self.read(index_key, |s| s.failure_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Last push duration in ms, or -1 if none was recorded.
    pub fn last_push_duration_ms(&self, index_key: &str) -> i64 {
        self.read(index_key, |s| s.last_push_duration_ms.load(Ordering::Relaxed))
            .unwrap_or(-1)
    }

    pub fn last_success_at(&self, index_key: &str) -> Option<DateTime<Utc>> {
        self.read(index_key, |s| *s.last_success_at.lock()).flatten()
    }

    /// Sum of successes across the configured keys
    pub fn total_success_count(&self) -> u64 {
        self.index_keys.iter().map(|k| self.success_count(k)).sum()
    }

    /// Sum of failures across the configured keys
    pub fn total_failure_count(&self) -> u64 {
        self.index_keys.iter().map(|k| self.failure_count(k)).sum()
    }

    pub fn snapshot(&self) -> Vec<IndexStatsSnapshot> {
        self.index_keys
            .iter()
            .map(|key| IndexStatsSnapshot {
                index_key: key.clone(),
                success_count: self.success_count(key),
                failure_count: self.failure_count(key),
                last_push_duration_ms: self.last_push_duration_ms(key),
                last_success_at: self.last_success_at(key),
            })
            .collect()
    }
}

impl Default for ExportStats {
    fn default() -> Self {
        Self::with_default_keys()
    }
}

impl StatsCollector for ExportStats {
    fn record_success(&self, destination: &str, count: usize) {
        ExportStats::record_success(self, destination, count as u64);
    }

    fn record_failure(&self, destination: &str, count: usize) {
        ExportStats::record_failure(self, destination, count as u64);
    }

    fn index_keys(&self) -> Vec<String> {
        self.index_keys.clone()
    }
}
