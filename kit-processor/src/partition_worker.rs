//! Partition Worker - runs the whole pipeline for one stream partition.
//!
//! Each partition gets its own worker, ensuring:
//! 1. Strict FIFO processing within the partition: a record is read, classified,
//!    deduplicated, written, alerted and checkpointed before the next one is read
//! 2. Parallelism across partitions
//! 3. Partition-scoped ownership of the dedup cache, with a single writer

use std::sync::Arc;
use std::time::{Duration, Instant};

use kit_common::health::HealthHandle;
use kit_common::{PartitionId, RawEvent, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{AlertChannel, AlertOutcome, AlertRouter};
use crate::checkpoint::{CheckpointConfig, CheckpointManager, CheckpointStore};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::dedup::{DedupConfig, Deduplicator};
use crate::error::PipelineError;
use crate::escalation::{Escalation, EscalationSink};
use crate::metrics_consts::{EVENTS_PROCESSED, EVENT_PROCESSING_DURATION, MALFORMED_PAYLOADS};
use crate::reader::{PartitionReader, Polled, ReaderConfig, StreamSource};
use crate::store::{EventStore, EventStoreWriter, WriterConfig};

/// The external collaborators the pipeline runs against.
#[derive(Clone)]
pub struct Backends {
    pub source: Arc<dyn StreamSource>,
    pub store: Arc<dyn EventStore>,
    pub alerts: Arc<dyn AlertChannel>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

/// Per-stage settings, derived from the service `Config`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub reader: ReaderConfig,
    pub dedup: DedupConfig,
    pub writer: WriterConfig,
    pub alert_retry_policy: RetryPolicy,
    pub call_timeout: Duration,
    pub checkpoint: CheckpointConfig,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        let call_timeout = config.call_timeout.0;

        Self {
            reader: ReaderConfig {
                retry_policy: config.read_retry_policy(),
                timeout: call_timeout,
            },
            dedup: DedupConfig {
                window: config.dedup_window(),
                max_entries: config.dedup_max_entries,
            },
            writer: WriterConfig {
                retry_policy: config.store_retry_policy(),
                timeout: call_timeout,
                stall_after_attempts: config.store_stall_after_attempts,
            },
            alert_retry_policy: config.alert_retry_policy(),
            call_timeout,
            checkpoint: CheckpointConfig {
                commit_every: config.checkpoint_commit_every,
                max_interval: config.checkpoint_max_interval.0,
                timeout: call_timeout,
            },
        }
    }
}

/// How a single record ended.
enum RecordOutcome {
    Completed,
    /// Shutdown interrupted the effects; the offset is not checkpointed.
    Abandoned,
}

pub struct PartitionWorker {
    partition: PartitionId,
    reader: PartitionReader,
    classifier: Classifier,
    dedup: Deduplicator,
    writer: EventStoreWriter,
    router: AlertRouter,
    checkpoints: CheckpointManager,
    escalations: EscalationSink,
    health: HealthHandle,
}

impl PartitionWorker {
    /// Build a worker positioned after the partition's last committed checkpoint.
    pub async fn start(
        partition: PartitionId,
        config: &PipelineConfig,
        backends: &Backends,
        classifier: Classifier,
        escalations: EscalationSink,
        health: HealthHandle,
    ) -> Result<Self, PipelineError> {
        let mut checkpoints = CheckpointManager::new(
            partition,
            backends.checkpoints.clone(),
            config.checkpoint.clone(),
        );
        let start_offset = checkpoints
            .resume_offset()
            .await
            .map_err(|error| PipelineError::CheckpointLoad { partition, error })?;

        info!(
            partition,
            start_offset = ?start_offset,
            policy = classifier.policy_name(),
            "Resuming partition"
        );

        Ok(Self {
            partition,
            reader: PartitionReader::new(
                partition,
                backends.source.clone(),
                start_offset,
                config.reader.clone(),
            ),
            classifier,
            dedup: Deduplicator::new(&config.dedup),
            writer: EventStoreWriter::new(
                partition,
                backends.store.clone(),
                config.writer.clone(),
                escalations.clone(),
                health.clone(),
            ),
            router: AlertRouter::new(
                backends.alerts.clone(),
                config.alert_retry_policy.clone(),
                config.call_timeout,
            ),
            checkpoints,
            escalations,
            health,
        })
    }

    /// Process records until shutdown, partition close, or a permanent source error.
    /// Pending checkpoints are flushed on every exit path.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        info!(partition = self.partition, "Starting partition worker");
        self.health.report_healthy();

        let result = loop {
            self.checkpoints.begin_read();

            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                polled = self.reader.next() => polled,
            };

            match polled {
                Ok(Polled::Record(event)) => {
                    self.health.report_healthy();
                    if let RecordOutcome::Abandoned = self.process(event, &shutdown).await {
                        break Ok(());
                    }
                }
                Ok(Polled::Idle) => {
                    self.health.report_healthy();
                    self.checkpoints.tick().await;
                }
                Ok(Polled::Closed) => {
                    self.health.deregister();
                    break Ok(());
                }
                Err(error) => break Err(PipelineError::Source(error)),
            }
        };

        if !self.checkpoints.flush().await {
            warn!(
                partition = self.partition,
                completed_offset = ?self.checkpoints.completed_offset(),
                "Final checkpoint flush failed, uncommitted events will be reprocessed"
            );
        }
        info!(
            partition = self.partition,
            committed_offset = ?self.checkpoints.committed_offset(),
            dedup_entries = self.dedup.len(),
            "Partition worker shutting down"
        );

        result
    }

    async fn process(&mut self, event: RawEvent, shutdown: &CancellationToken) -> RecordOutcome {
        let started = Instant::now();
        let offset = event.partition_offset;
        self.checkpoints.record_read(offset);

        let classified = self.classifier.classify(event);
        if classified.malformed {
            warn!(
                partition = self.partition,
                offset,
                device_id = classified.device_id(),
                event_id = classified.event_id(),
                "Malformed payload, storing as routine"
            );
            metrics::counter!(MALFORMED_PAYLOADS).increment(1);
        }

        if self.dedup.should_process(&classified) {
            let record = classified.to_record();
            if let Err(error) = self.writer.upsert(&record, shutdown).await {
                warn!(
                    partition = self.partition,
                    offset,
                    error = %error,
                    "Abandoning event before it was persisted"
                );
                self.dedup.rollback(&classified.dedup_key);
                self.checkpoints.abandon();
                return RecordOutcome::Abandoned;
            }
            self.dedup.mark_written(&classified.dedup_key);

            if let Some(alert) = classified.to_alert() {
                match self.router.route(&alert, shutdown).await {
                    AlertOutcome::Delivered { .. } => {}
                    AlertOutcome::Failed { attempts, error } => {
                        self.escalations.raise(Escalation::AlertDeliveryFailed {
                            partition: self.partition,
                            device_id: alert.device_id,
                            event_id: alert.event_id,
                            attempts,
                            error: error.to_string(),
                        });
                    }
                    AlertOutcome::Abandoned { attempts } => {
                        warn!(
                            partition = self.partition,
                            offset,
                            attempts,
                            "Abandoning alert delivery on shutdown"
                        );
                        self.checkpoints.abandon();
                        return RecordOutcome::Abandoned;
                    }
                }
            }
        } else {
            debug!(
                partition = self.partition,
                offset, "Duplicate within the dedup window, skipping effects"
            );
        }

        self.checkpoints.effects_complete(offset).await;

        metrics::counter!(EVENTS_PROCESSED, "severity" => classified.severity.as_str())
            .increment(1);
        metrics::histogram!(EVENT_PROCESSING_DURATION).record(started.elapsed().as_secs_f64());

        RecordOutcome::Completed
    }
}

impl std::fmt::Debug for PartitionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionWorker")
            .field("partition", &self.partition)
            .field("reader", &self.reader)
            .field("checkpoints", &self.checkpoints)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use envconfig::Envconfig;
    use kit_common::health::HealthRegistry;
    use kit_common::Severity;
    use tokio::sync::mpsc;

    use super::*;
    use crate::classifier::policy::{build_policy, PolicySettings, SeverityPolicyKind};
    use crate::error::{ChannelError, SourceError};
    use crate::escalation::escalation_channel;
    use crate::memory::{
        MemoryAlertChannel, MemoryCheckpointStore, MemoryEventStore, MemoryStreamSource,
    };

    struct Harness {
        source: MemoryStreamSource,
        store: Arc<MemoryEventStore>,
        alerts: Arc<MemoryAlertChannel>,
        checkpoints: Arc<MemoryCheckpointStore>,
        escalations: mpsc::Receiver<Escalation>,
        sink: EscalationSink,
        registry: HealthRegistry,
    }

    impl Harness {
        fn new() -> Self {
            let (sink, escalations) = escalation_channel(16);
            Self {
                source: MemoryStreamSource::new(),
                store: Arc::new(MemoryEventStore::new()),
                alerts: Arc::new(MemoryAlertChannel::new()),
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
                escalations,
                sink,
                registry: HealthRegistry::new("liveness"),
            }
        }

        async fn worker(&self) -> PartitionWorker {
            let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
            let backends = Backends {
                source: Arc::new(self.source.clone()),
                store: self.store.clone(),
                alerts: self.alerts.clone(),
                checkpoints: self.checkpoints.clone(),
            };
            let classifier = Classifier::new(build_policy(
                SeverityPolicyKind::Vitals,
                &PolicySettings::default(),
            ));
            let health = self
                .registry
                .register("partition-0".to_owned(), Duration::from_secs(30));

            PartitionWorker::start(
                0,
                &PipelineConfig::from_config(&config),
                &backends,
                classifier,
                self.sink.clone(),
                health,
            )
            .await
            .unwrap()
        }

        async fn run_to_close(&self) -> Result<(), PipelineError> {
            self.source.close(0);
            self.worker().await.run(CancellationToken::new()).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_routine_and_critical_events() {
        let h = Harness::new();
        h.source.push(0, "kit-1", "e1", r#"{"heart_rate": 72}"#);
        h.source.push(0, "kit-42", "e1", r#"{"fall_detected": true}"#);

        h.run_to_close().await.unwrap();

        let records = h.store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].severity, Severity::Routine);
        assert_eq!(records[1].severity, Severity::Critical);

        let delivered = h.alerts.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].device_id, "kit-42");
        assert_eq!(delivered[0].reason, "fall detected");

        assert_eq!(h.checkpoints.get(0), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_in_window_skip_effects_but_advance_checkpoint() {
        let h = Harness::new();
        h.source.push(0, "kit-42", "e1", r#"{"panic_button": true}"#);
        h.source.push(0, "kit-42", "e1", r#"{"panic_button": true}"#);

        h.run_to_close().await.unwrap();

        assert_eq!(h.store.write_attempts(), 1);
        assert_eq!(h.alerts.attempts(), 1);
        assert_eq!(h.checkpoints.get(0), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_failure_escalates_without_blocking_checkpoint() {
        let mut h = Harness::new();
        h.alerts
            .fail_always(ChannelError::Unavailable("broker down".to_owned()));
        h.source.push(0, "kit-42", "e1", r#"{"spo2": 70}"#);

        h.run_to_close().await.unwrap();

        assert_eq!(h.store.len(), 1);
        assert_eq!(h.checkpoints.get(0), Some(0));
        assert!(matches!(
            h.escalations.try_recv().unwrap(),
            Escalation::AlertDeliveryFailed { attempts: 3, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_source_error_stops_worker() {
        let h = Harness::new();
        h.source.push(0, "kit-1", "e1", "{}");
        h.source.fail_next_polls(
            0,
            [SourceError::Permanent {
                partition: 0,
                message: "partition deleted".to_owned(),
            }],
        );

        let result = h.worker().await.run(CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(PipelineError::Source(SourceError::Permanent { .. }))
        ));
        assert_eq!(h.checkpoints.get(0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_store_stall_blocks_checkpoint() {
        let h = Harness::new();
        h.store
            .fail_always(crate::error::StoreError::Unavailable("down".to_owned()));
        h.source.push(0, "kit-1", "e1", "{}");

        let shutdown = CancellationToken::new();
        let worker = h.worker().await;
        let task = tokio::spawn(worker.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(h.store.len(), 0);
        assert_eq!(h.checkpoints.get(0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_after_committed_checkpoint() {
        let h = Harness::new();
        h.checkpoints.set(0, 0);
        h.source.push(0, "kit-1", "e1", "{}");
        h.source.push(0, "kit-1", "e2", "{}");

        h.run_to_close().await.unwrap();

        let records = h.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_id, "e2");
        assert_eq!(h.checkpoints.get(0), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_while_running() {
        let h = Harness::new();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.worker().await.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.registry.get_status().healthy);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
