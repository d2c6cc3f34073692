//! Event Store Writer - idempotent persistence of every event, retried until acknowledged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kit_common::health::HealthHandle;
use kit_common::{PartitionId, RetryPolicy, StoredEventRecord};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{PersistenceError, StoreError};
use crate::escalation::{Escalation, EscalationSink};
use crate::metrics_consts::{STORE_UPSERTS, STORE_WRITE_RETRIES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First write of this `(device_id, event_id)`.
    Inserted,
    /// Identical record already stored, nothing changed.
    Unchanged,
    /// Same key with different content, overwritten.
    Updated,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Inserted => "inserted",
            UpsertOutcome::Unchanged => "unchanged",
            UpsertOutcome::Updated => "updated",
        }
    }
}

/// A document store partitioned by device id, with idempotent upserts keyed by
/// `(device_id, event_id)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Returns only once the store confirmed durability.
    async fn upsert(&self, record: &StoredEventRecord) -> Result<UpsertOutcome, StoreError>;

    async fn get(
        &self,
        device_id: &str,
        event_id: &str,
    ) -> Result<Option<StoredEventRecord>, StoreError>;

    /// Records of one device with `from <= timestamp < to`, oldest first.
    async fn list_for_device(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredEventRecord>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub retry_policy: RetryPolicy,
    pub timeout: Duration,
    /// Consecutive failures after which the partition is reported stalled.
    pub stall_after_attempts: u32,
}

pub struct EventStoreWriter {
    partition: PartitionId,
    store: Arc<dyn EventStore>,
    config: WriterConfig,
    escalations: EscalationSink,
    health: HealthHandle,
}

impl EventStoreWriter {
    pub fn new(
        partition: PartitionId,
        store: Arc<dyn EventStore>,
        config: WriterConfig,
        escalations: EscalationSink,
        health: HealthHandle,
    ) -> Self {
        Self {
            partition,
            store,
            config,
            escalations,
            health,
        }
    }

    /// Upsert a record, retrying every failure with capped backoff until the store
    /// acknowledges it. Only shutdown ends the loop early, with
    /// `PersistenceError::Cancelled`.
    pub async fn upsert(
        &self,
        record: &StoredEventRecord,
        shutdown: &CancellationToken,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let mut attempts = 0;
        let mut stalled = false;

        loop {
            attempts += 1;

            let error = match tokio::time::timeout(self.config.timeout, self.store.upsert(record))
                .await
            {
                Ok(Ok(outcome)) => {
                    if stalled {
                        info!(
                            partition = self.partition,
                            device_id = %record.device_id,
                            event_id = %record.event_id,
                            attempts,
                            "Event store recovered"
                        );
                        self.health.report_healthy();
                    }
                    metrics::counter!(STORE_UPSERTS, "outcome" => outcome.as_str()).increment(1);
                    return Ok(outcome);
                }
                Ok(Err(error)) => error,
                Err(_) => StoreError::Timeout(self.config.timeout),
            };

            metrics::counter!(STORE_WRITE_RETRIES).increment(1);
            if error.is_transient() {
                warn!(
                    partition = self.partition,
                    device_id = %record.device_id,
                    event_id = %record.event_id,
                    attempts,
                    error = %error,
                    "Event store write failed, retrying"
                );
            } else {
                // Dropping the record is not an option, keep retrying and let an operator act
                error!(
                    partition = self.partition,
                    device_id = %record.device_id,
                    event_id = %record.event_id,
                    attempts,
                    error = %error,
                    "Event store rejected the record, retrying"
                );
            }

            if attempts == self.config.stall_after_attempts {
                stalled = true;
                self.health.report_unhealthy();
                self.escalations.raise(Escalation::PersistenceStalled {
                    partition: self.partition,
                    device_id: record.device_id.clone(),
                    event_id: record.event_id.clone(),
                    attempts,
                    error: error.to_string(),
                });
            } else if !stalled {
                self.health.report_healthy();
            }

            let interval = self.config.retry_policy.retry_interval(attempts);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(PersistenceError::Cancelled {
                        device_id: record.device_id.clone(),
                        event_id: record.event_id.clone(),
                        attempts,
                    });
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use kit_common::health::{ComponentStatus, HealthRegistry};
    use kit_common::Severity;
    use tokio::sync::mpsc;

    use super::*;
    use crate::escalation::escalation_channel;
    use crate::memory::MemoryEventStore;

    fn record(event_id: &str) -> StoredEventRecord {
        StoredEventRecord {
            device_id: "kit-42".to_owned(),
            event_id: event_id.to_owned(),
            timestamp: Utc::now(),
            severity: Severity::Routine,
            malformed: false,
            payload: Bytes::from_static(br#"{"heart_rate": 70}"#),
        }
    }

    struct Harness {
        writer: EventStoreWriter,
        store: Arc<MemoryEventStore>,
        registry: HealthRegistry,
        escalations: mpsc::Receiver<Escalation>,
    }

    fn harness(stall_after_attempts: u32) -> Harness {
        let store = Arc::new(MemoryEventStore::new());
        let registry = HealthRegistry::new("liveness");
        let health = registry.register("partition-0".to_owned(), Duration::from_secs(30));
        let (sink, escalations) = escalation_channel(8);
        let config = WriterConfig {
            retry_policy: RetryPolicy::build(2, Duration::from_millis(200))
                .maximum_interval(Duration::from_secs(30))
                .provide(),
            timeout: Duration::from_secs(5),
            stall_after_attempts,
        };

        Harness {
            writer: EventStoreWriter::new(0, store.clone(), config, sink, health),
            store,
            registry,
            escalations,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_is_idempotent() {
        let h = harness(10);
        let record = record("e1");
        let shutdown = CancellationToken::new();

        assert_eq!(
            h.writer.upsert(&record, &shutdown).await,
            Ok(UpsertOutcome::Inserted)
        );
        assert_eq!(
            h.writer.upsert(&record, &shutdown).await,
            Ok(UpsertOutcome::Unchanged)
        );
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_until_acknowledged() {
        let h = harness(10);
        h.store.fail_next([
            StoreError::Throttled,
            StoreError::Timeout(Duration::from_secs(5)),
            StoreError::Unavailable("connection reset".to_owned()),
        ]);

        let outcome = h
            .writer
            .upsert(&record("e1"), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Ok(UpsertOutcome::Inserted));
        assert_eq!(h.store.write_attempts(), 4);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_retried_too() {
        let h = harness(10);
        h.store.fail_next([StoreError::Rejected("constraint".to_owned())]);

        let outcome = h
            .writer
            .upsert(&record("e1"), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Ok(UpsertOutcome::Inserted));
        assert_eq!(h.store.write_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_escalates_and_recovers() {
        let mut h = harness(3);
        h.store
            .fail_next(std::iter::repeat(StoreError::Throttled).take(5));

        let outcome = h
            .writer
            .upsert(&record("e1"), &CancellationToken::new())
            .await;
        assert_eq!(outcome, Ok(UpsertOutcome::Inserted));

        let escalation = h.escalations.try_recv().unwrap();
        assert!(matches!(
            escalation,
            Escalation::PersistenceStalled { attempts: 3, .. }
        ));
        assert!(h.escalations.try_recv().is_err(), "escalates once per stall");

        // Healthy again after the write went through
        assert!(h.registry.get_status().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_partition_reports_unhealthy() {
        let h = harness(2);
        h.store.fail_always(StoreError::Unavailable("down".to_owned()));
        let shutdown = CancellationToken::new();

        let writer = h.writer;
        let record = record("e1");
        let token = shutdown.clone();
        let task = tokio::spawn(async move { writer.upsert(&record, &token).await });

        // Attempts at 0s and 0.2s, the stall is raised on the second
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            h.registry.get_status().components.get("partition-0"),
            Some(&ComponentStatus::Unhealthy)
        );

        shutdown.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(PersistenceError::Cancelled { .. })));
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_retry_loop() {
        let h = harness(10);
        h.store.fail_always(StoreError::Throttled);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = h.writer.upsert(&record("e1"), &shutdown).await;

        assert_eq!(
            result,
            Err(PersistenceError::Cancelled {
                device_id: "kit-42".to_owned(),
                event_id: "e1".to_owned(),
                attempts: 1,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out_and_retries() {
        let h = harness(10);
        h.store.delay_next(Duration::from_secs(60));

        let outcome = h
            .writer
            .upsert(&record("e1"), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Ok(UpsertOutcome::Inserted));
        assert_eq!(h.store.write_attempts(), 2);
    }
}
