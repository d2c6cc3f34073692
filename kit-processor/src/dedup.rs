//! Deduplicator - bounded, time-windowed record of recently written dedup keys.
//!
//! The cache only saves redundant store writes and alerts for redeliveries that
//! arrive within the window. It is not the source of truth: a key missing from the
//! cache does not mean the event was never written, and the idempotent store upsert
//! is what keeps the store free of duplicates.
//!
//! Each partition worker owns its own `Deduplicator`, so there is a single writer
//! per instance.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kit_common::ClassifiedEvent;
use moka::sync::Cache;
use tracing::debug;

use crate::metrics_consts::{DEDUP_HITS, DEDUP_MISSES, DEDUP_ROLLBACKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupState {
    /// Downstream effects are in flight.
    Pending,
    /// The store acknowledged the write.
    Written,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    pub dedup_key: String,
    pub first_seen_at: DateTime<Utc>,
    pub state: DedupState,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a written key is remembered.
    pub window: Duration,
    /// Maximum number of keys remembered, least recently used are evicted first.
    pub max_entries: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(600),
            max_entries: 100_000,
        }
    }
}

#[derive(Clone)]
pub struct Deduplicator {
    cache: Cache<String, DedupEntry>,
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        let cache = Cache::builder()
            .time_to_live(config.window)
            .max_capacity(config.max_entries)
            .build();

        Self { cache }
    }

    /// Returns false when the event was already written within the window, in which
    /// case downstream effects must be skipped. Otherwise records the key as pending
    /// and returns true.
    pub fn should_process(&self, event: &ClassifiedEvent) -> bool {
        let entry = self
            .cache
            .entry(event.dedup_key.clone())
            .or_insert_with(|| DedupEntry {
                dedup_key: event.dedup_key.clone(),
                first_seen_at: Utc::now(),
                state: DedupState::Pending,
            });

        if entry.is_fresh() {
            metrics::counter!(DEDUP_MISSES).increment(1);
            return true;
        }

        match entry.value().state {
            DedupState::Written => {
                debug!(
                    device_id = event.device_id(),
                    event_id = event.event_id(),
                    first_seen_at = %entry.value().first_seen_at,
                    "Skipping event already written within the dedup window"
                );
                metrics::counter!(DEDUP_HITS).increment(1);
                false
            }
            // A leftover pending marker means an earlier attempt was abandoned without
            // rollback. Run the effects again, the store upsert absorbs the repeat.
            DedupState::Pending => {
                metrics::counter!(DEDUP_MISSES).increment(1);
                true
            }
        }
    }

    /// Promote a pending key to written, after the store acknowledged the upsert.
    pub fn mark_written(&self, dedup_key: &str) {
        let first_seen_at = self
            .cache
            .get(dedup_key)
            .map(|entry| entry.first_seen_at)
            .unwrap_or_else(Utc::now);

        self.cache.insert(
            dedup_key.to_owned(),
            DedupEntry {
                dedup_key: dedup_key.to_owned(),
                first_seen_at,
                state: DedupState::Written,
            },
        );
    }

    /// Drop a pending marker so the event is processed again on redelivery.
    /// Written keys are left alone.
    pub fn rollback(&self, dedup_key: &str) {
        if let Some(entry) = self.cache.get(dedup_key) {
            if entry.state == DedupState::Pending {
                self.cache.invalidate(dedup_key);
                metrics::counter!(DEDUP_ROLLBACKS).increment(1);
            }
        }
    }

    /// Number of keys currently remembered. Flushes moka's pending maintenance
    /// first, so expired and evicted keys are not counted.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

#[cfg(test)]
impl Deduplicator {
    fn state(&self, dedup_key: &str) -> Option<DedupState> {
        self.cache.get(dedup_key).map(|entry| entry.state)
    }
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("cache", &"<moka cache>")
            .finish()
    }
}
