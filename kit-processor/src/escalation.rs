//! Operator escalation signals.
//!
//! Conditions that degrade service without stopping the pipeline are reported here
//! instead of being returned as errors. Raising never blocks: the channel is bounded
//! and a full channel drops the signal, which is counted and logged.

use kit_common::PartitionId;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::metrics_consts::{ESCALATIONS, ESCALATIONS_DROPPED};

#[derive(Debug, Clone, PartialEq)]
pub enum Escalation {
    /// A critical event was persisted but its alert could not be delivered.
    AlertDeliveryFailed {
        partition: PartitionId,
        device_id: String,
        event_id: String,
        attempts: u32,
        error: String,
    },
    /// The event store has failed repeatedly; the partition is not advancing.
    PersistenceStalled {
        partition: PartitionId,
        device_id: String,
        event_id: String,
        attempts: u32,
        error: String,
    },
    /// The partition worker stopped on a permanent error.
    PartitionFailed {
        partition: PartitionId,
        error: String,
    },
}

impl Escalation {
    pub fn kind(&self) -> &'static str {
        match self {
            Escalation::AlertDeliveryFailed { .. } => "alert_delivery_failed",
            Escalation::PersistenceStalled { .. } => "persistence_stalled",
            Escalation::PartitionFailed { .. } => "partition_failed",
        }
    }

    pub fn partition(&self) -> PartitionId {
        match self {
            Escalation::AlertDeliveryFailed { partition, .. }
            | Escalation::PersistenceStalled { partition, .. }
            | Escalation::PartitionFailed { partition, .. } => *partition,
        }
    }
}

/// Sending half handed to every component that can escalate.
#[derive(Clone, Debug)]
pub struct EscalationSink {
    sender: mpsc::Sender<Escalation>,
}

pub fn escalation_channel(capacity: usize) -> (EscalationSink, mpsc::Receiver<Escalation>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (EscalationSink { sender }, receiver)
}

impl EscalationSink {
    pub fn raise(&self, escalation: Escalation) {
        match self.sender.try_send(escalation) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(escalation)) => {
                warn!(
                    kind = escalation.kind(),
                    partition = escalation.partition(),
                    "Escalation channel full, dropping signal"
                );
                metrics::counter!(ESCALATIONS_DROPPED, "kind" => escalation.kind()).increment(1);
            }
            Err(mpsc::error::TrySendError::Closed(escalation)) => {
                warn!(
                    kind = escalation.kind(),
                    partition = escalation.partition(),
                    "Escalation channel closed, dropping signal"
                );
                metrics::counter!(ESCALATIONS_DROPPED, "kind" => escalation.kind()).increment(1);
            }
        }
    }
}

/// Logs every escalation until all senders are dropped.
pub async fn drain_escalations(mut receiver: mpsc::Receiver<Escalation>) {
    while let Some(escalation) = receiver.recv().await {
        metrics::counter!(ESCALATIONS, "kind" => escalation.kind()).increment(1);

        match &escalation {
            Escalation::AlertDeliveryFailed {
                partition,
                device_id,
                event_id,
                attempts,
                error,
            } => error!(
                partition,
                device_id = %device_id,
                event_id = %event_id,
                attempts,
                error = %error,
                "Critical event persisted but alert delivery failed"
            ),
            Escalation::PersistenceStalled {
                partition,
                device_id,
                event_id,
                attempts,
                error,
            } => error!(
                partition,
                device_id = %device_id,
                event_id = %event_id,
                attempts,
                error = %error,
                "Event store writes are stalled, partition is not advancing"
            ),
            Escalation::PartitionFailed { partition, error } => {
                error!(partition, error = %error, "Partition worker failed")
            }
        }
    }
}
