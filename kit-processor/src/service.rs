use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use kit_common::health::HealthRegistry;
use kit_common::PartitionId;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::classifier::policy::build_policy;
use crate::classifier::Classifier;
use crate::config::{Config, PartitionFailurePolicy};
use crate::escalation::{drain_escalations, escalation_channel, Escalation, EscalationSink};
use crate::metrics_consts::PARTITION_RESTARTS;
use crate::partition_worker::{Backends, PartitionWorker, PipelineConfig};

const ESCALATION_CHANNEL_CAPACITY: usize = 1024;

/// Everything a partition supervisor needs, shared between partitions.
struct Shared {
    config: Config,
    pipeline: PipelineConfig,
    backends: Backends,
    classifier: Classifier,
    liveness: HealthRegistry,
    escalations: EscalationSink,
}

/// The kit processor service: one supervised worker per stream partition.
pub struct KitProcessorService {
    shared: Arc<Shared>,
    escalations: tokio::sync::mpsc::Receiver<Escalation>,
}

impl KitProcessorService {
    pub fn new(config: Config, backends: Backends, liveness: HealthRegistry) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for service with {} partitions",
                config.partition_count
            )
        })?;

        let classifier = Classifier::new(build_policy(
            config.severity_policy,
            &config.policy_settings(),
        ));
        let (sink, escalations) = escalation_channel(ESCALATION_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                pipeline: PipelineConfig::from_config(&config),
                config,
                backends,
                classifier,
                liveness,
                escalations: sink,
            }),
            escalations,
        })
    }

    /// Run until ctrl+c.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e}");
            }
        })
        .await
    }

    /// Run until `shutdown_signal` resolves, every partition closed, or a partition
    /// failed under the `exit` policy.
    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl Future<Output = ()>,
    ) -> Result<()> {
        let KitProcessorService {
            shared,
            escalations,
        } = self;

        info!(
            partitions = shared.config.partition_count,
            policy = shared.classifier.policy_name(),
            "Starting kit processor service"
        );

        let drain = tokio::spawn(drain_escalations(escalations));
        let shutdown = CancellationToken::new();

        let mut workers = JoinSet::new();
        for partition in shared.config.partitions() {
            workers.spawn(supervise_partition(
                partition,
                shared.clone(),
                shutdown.clone(),
            ));
        }

        tokio::pin!(shutdown_signal);
        let result = loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Received shutdown signal, shutting down gracefully...");
                    break Ok(());
                }
                joined = workers.join_next() => match joined {
                    None => {
                        info!("All partitions closed");
                        break Ok(());
                    }
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        error!("Partition supervisor stopped with error: {e:#}");
                        break Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Partition supervisor panicked: {e:#}");
                        break Err(e).context("Partition supervisor task failed");
                    }
                }
            }
        };

        shutdown.cancel();
        let shutdown_timeout = shared.config.shutdown_timeout();
        let stopped = tokio::time::timeout(shutdown_timeout, async {
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Partition supervisor stopped with error: {e:#}"),
                    Err(e) => warn!("Partition supervisor panicked: {e:#}"),
                }
            }
        })
        .await;
        if stopped.is_err() {
            error!("Partition shutdown timed out after {shutdown_timeout:?}, aborting");
            workers.abort_all();
        }

        // Workers hold the remaining senders; the drain ends once they are gone
        drop(shared);
        if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
            warn!("Timed out draining escalations");
        }

        info!("Kit processor service stopped");
        result
    }
}

/// Run one partition, restarting it from its last checkpoint on failure unless the
/// policy says to exit.
async fn supervise_partition(
    partition: PartitionId,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<()> {
    let component = format!("partition-{partition}");

    loop {
        let health = shared
            .liveness
            .register(component.clone(), shared.config.health_deadline());

        let result = match PartitionWorker::start(
            partition,
            &shared.pipeline,
            &shared.backends,
            shared.classifier.clone(),
            shared.escalations.clone(),
            health.clone(),
        )
        .await
        {
            Ok(worker) => worker.run(shutdown.clone()).await,
            Err(e) => Err(e),
        };

        let error = match result {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        error!(partition, error = %error, "Partition worker failed");
        health.report_unhealthy();
        shared.escalations.raise(Escalation::PartitionFailed {
            partition,
            error: error.to_string(),
        });

        match shared.config.on_partition_failure {
            PartitionFailurePolicy::Exit => {
                return Err(error).with_context(|| format!("Partition {partition} failed"));
            }
            PartitionFailurePolicy::Restart => {
                let backoff = shared.config.restart_backoff.0;
                info!(partition, ?backoff, "Restarting partition worker");
                metrics::counter!(PARTITION_RESTARTS).increment(1);

                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}
