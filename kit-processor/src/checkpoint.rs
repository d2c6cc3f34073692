//! Checkpoint Manager - advances the durable read position of one partition.
//!
//! Per partition the manager cycles `Idle -> Reading -> AwaitingEffects -> Committed`
//! and back to `Reading` for the next offset. An offset becomes committable only
//! once its event was persisted, and its alert routed when critical. Durable
//! commits can be coalesced; the committed offset never exceeds the last fully
//! effected one and never moves backwards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kit_common::{PartitionCheckpoint, PartitionId};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CheckpointError;
use crate::metrics_consts::{CHECKPOINT_COMMITS, CHECKPOINT_LAG};

/// Durable storage for partition checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(
        &self,
        partition: PartitionId,
    ) -> Result<Option<PartitionCheckpoint>, CheckpointError>;

    /// Implementations must keep the greatest offset ever committed.
    async fn commit(&self, checkpoint: PartitionCheckpoint) -> Result<(), CheckpointError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Idle,
    Reading,
    AwaitingEffects { offset: i64 },
    Committed { offset: i64 },
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Write a durable checkpoint after this many completed events.
    pub commit_every: u32,
    /// Write a durable checkpoint at least this often while events complete.
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            commit_every: 1,
            max_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }
}

pub struct CheckpointManager {
    partition: PartitionId,
    store: Arc<dyn CheckpointStore>,
    config: CheckpointConfig,
    state: CheckpointState,
    last_read: Option<i64>,
    /// Last offset whose effects completed.
    completed: Option<i64>,
    /// Last offset durably written to the store.
    committed: Option<i64>,
    uncommitted: u32,
    last_commit_at: Instant,
}

impl CheckpointManager {
    pub fn new(
        partition: PartitionId,
        store: Arc<dyn CheckpointStore>,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            partition,
            store,
            config,
            state: CheckpointState::Idle,
            last_read: None,
            completed: None,
            committed: None,
            uncommitted: 0,
            last_commit_at: Instant::now(),
        }
    }

    /// Load the durable checkpoint and return the offset to resume reading from,
    /// or `None` to start at the beginning of the partition.
    pub async fn resume_offset(&mut self) -> Result<Option<i64>, CheckpointError> {
        let loaded = tokio::time::timeout(self.config.timeout, self.store.load(self.partition))
            .await
            .map_err(|_| CheckpointError::Timeout(self.config.timeout))??;

        self.committed = loaded.map(|checkpoint| checkpoint.offset);
        self.completed = self.committed;
        self.last_read = self.committed;
        self.last_commit_at = Instant::now();
        self.record_lag();

        Ok(loaded.map(|checkpoint| checkpoint.resume_offset()))
    }

    pub fn begin_read(&mut self) {
        match self.state {
            CheckpointState::Idle | CheckpointState::Committed { .. } => {
                self.state = CheckpointState::Reading
            }
            CheckpointState::Reading => {}
            CheckpointState::AwaitingEffects { offset } => warn!(
                partition = self.partition,
                offset, "Reading the next record while effects are still pending"
            ),
        }
    }

    pub fn record_read(&mut self, offset: i64) {
        self.state = CheckpointState::AwaitingEffects { offset };
        self.last_read = Some(self.last_read.map_or(offset, |last| last.max(offset)));
        self.record_lag();
    }

    /// Mark the in-flight offset as fully effected and commit if due.
    pub async fn effects_complete(&mut self, offset: i64) {
        if self.state != (CheckpointState::AwaitingEffects { offset }) {
            warn!(
                partition = self.partition,
                offset,
                state = ?self.state,
                "Completing effects for an offset that is not in flight"
            );
        }

        self.state = CheckpointState::Committed { offset };
        if self.completed.map_or(true, |completed| offset > completed) {
            self.completed = Some(offset);
            self.uncommitted += 1;
        }

        if self.uncommitted >= self.config.commit_every
            || self.last_commit_at.elapsed() >= self.config.max_interval
        {
            self.commit().await;
        }
    }

    /// The in-flight effects were abandoned; the offset will be read again.
    pub fn abandon(&mut self) {
        if let CheckpointState::AwaitingEffects { offset } = self.state {
            debug!(
                partition = self.partition,
                offset, "Abandoning in-flight offset, it will be redelivered"
            );
        }
        self.state = CheckpointState::Idle;
    }

    /// Commit pending completions once the interval elapsed, for idle partitions.
    pub async fn tick(&mut self) {
        if self.has_uncommitted() && self.last_commit_at.elapsed() >= self.config.max_interval {
            self.commit().await;
        }
    }

    /// Commit whatever completed, regardless of coalescing. Called on shutdown.
    pub async fn flush(&mut self) -> bool {
        if self.has_uncommitted() {
            self.commit().await
        } else {
            true
        }
    }

    async fn commit(&mut self) -> bool {
        let Some(offset) = self.completed else {
            return true;
        };
        let checkpoint = PartitionCheckpoint::new(self.partition, offset);

        let result = tokio::time::timeout(self.config.timeout, self.store.commit(checkpoint))
            .await
            .unwrap_or(Err(CheckpointError::Timeout(self.config.timeout)));

        match result {
            Ok(()) => {
                debug!(partition = self.partition, offset, "Committed checkpoint");
                metrics::counter!(CHECKPOINT_COMMITS, "outcome" => "success").increment(1);
                self.committed = Some(offset);
                self.uncommitted = 0;
                self.last_commit_at = Instant::now();
                self.record_lag();
                true
            }
            Err(error) => {
                // Kept pending and retried on the next completion. Reprocessing is safe.
                warn!(
                    partition = self.partition,
                    offset,
                    error = %error,
                    "Failed to commit checkpoint"
                );
                metrics::counter!(CHECKPOINT_COMMITS, "outcome" => "failure").increment(1);
                false
            }
        }
    }

    fn has_uncommitted(&self) -> bool {
        match (self.completed, self.committed) {
            (Some(completed), Some(committed)) => completed > committed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn record_lag(&self) {
        let lag = match (self.last_read, self.committed) {
            (Some(read), Some(committed)) => read - committed,
            (Some(read), None) => read + 1,
            (None, _) => 0,
        };
        metrics::gauge!(CHECKPOINT_LAG, "partition" => self.partition.to_string())
            .set(lag.max(0) as f64);
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    /// Last durably committed offset.
    pub fn committed_offset(&self) -> Option<i64> {
        self.committed
    }

    pub fn completed_offset(&self) -> Option<i64> {
        self.completed
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("partition", &self.partition)
            .field("state", &self.state)
            .field("completed", &self.completed)
            .field("committed", &self.committed)
            .finish()
    }
}
