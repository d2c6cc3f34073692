//! Alert Router - at-least-once delivery of alerts for critical events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kit_common::{AlertMessage, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::metrics_consts::{ALERT_DELIVERIES, ALERT_DELIVERY_ATTEMPTS};

/// A low-latency channel accepting opaque alert messages, at least once.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn enqueue(&self, alert: &AlertMessage) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertOutcome {
    Delivered {
        attempts: u32,
    },
    /// Retries exhausted, or the channel rejected the message.
    Failed {
        attempts: u32,
        error: ChannelError,
    },
    /// Shutdown interrupted the retries. The event must not be checkpointed.
    Abandoned {
        attempts: u32,
    },
}

impl AlertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertOutcome::Delivered { .. } => "delivered",
            AlertOutcome::Failed { .. } => "failed",
            AlertOutcome::Abandoned { .. } => "abandoned",
        }
    }
}

#[derive(Clone)]
pub struct AlertRouter {
    channel: Arc<dyn AlertChannel>,
    retry_policy: RetryPolicy,
    timeout: Duration,
}

impl AlertRouter {
    pub fn new(channel: Arc<dyn AlertChannel>, retry_policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            channel,
            retry_policy,
            timeout,
        }
    }

    /// Deliver an alert with bounded retries.
    ///
    /// The first attempt always runs to completion or timeout. Cancellation is only
    /// observed between attempts, so an alert that was in flight at shutdown is not
    /// reported as abandoned after it was accepted.
    pub async fn route(&self, alert: &AlertMessage, shutdown: &CancellationToken) -> AlertOutcome {
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            metrics::counter!(ALERT_DELIVERY_ATTEMPTS).increment(1);

            let error = match tokio::time::timeout(self.timeout, self.channel.enqueue(alert)).await
            {
                Ok(Ok(())) => break AlertOutcome::Delivered { attempts },
                Ok(Err(error)) => error,
                Err(_) => ChannelError::Timeout(self.timeout),
            };

            if !error.is_retryable() || !self.retry_policy.has_attempts_left(attempts) {
                break AlertOutcome::Failed { attempts, error };
            }

            let interval = self.retry_policy.jittered_interval(attempts);
            warn!(
                device_id = %alert.device_id,
                event_id = %alert.event_id,
                attempts,
                error = %error,
                retry_in = ?interval,
                "Alert delivery failed, retrying"
            );

            tokio::select! {
                _ = shutdown.cancelled() => break AlertOutcome::Abandoned { attempts },
                _ = tokio::time::sleep(interval) => {}
            }
        };

        debug!(
            device_id = %alert.device_id,
            event_id = %alert.event_id,
            outcome = outcome.as_str(),
            "Alert routing finished"
        );
        metrics::counter!(ALERT_DELIVERIES, "outcome" => outcome.as_str()).increment(1);

        outcome
    }
}

impl std::fmt::Debug for AlertRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertRouter")
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}
