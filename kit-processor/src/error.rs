use std::time;

use kit_common::PartitionId;
use thiserror::Error;

/// Errors raised by a `StreamSource` while reading a partition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("transient read error on partition {partition}: {message}")]
    Transient {
        partition: PartitionId,
        message: String,
    },
    #[error("read from partition {partition} timed out after {timeout:?}")]
    Timeout {
        partition: PartitionId,
        timeout: time::Duration,
    },
    #[error("partition {partition} is permanently unavailable: {message}")]
    Permanent {
        partition: PartitionId,
        message: String,
    },
}

impl SourceError {
    /// Transient errors are retried by the reader; permanent ones stop the partition worker.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::Permanent { .. })
    }
}

/// Errors raised by an `EventStore`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("event store is throttling writes")]
    Throttled,
    #[error("event store call timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("event store unavailable: {0}")]
    Unavailable(String),
    #[error("event store rejected the record: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Rejected(_))
    }
}

/// Errors raised by an `AlertChannel`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("alert channel call timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("alert channel unavailable: {0}")]
    Unavailable(String),
    #[error("alert channel rejected the message: {0}")]
    Rejected(String),
}

impl ChannelError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChannelError::Rejected(_))
    }
}

/// Errors raised by a `CheckpointStore`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckpointError {
    #[error("checkpoint store call timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Terminal outcome of the event store writer when it gives up.
/// Persistence is retried forever, so the only way out is shutdown.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("persistence of {device_id}/{event_id} cancelled after {attempts} attempts")]
    Cancelled {
        device_id: String,
        event_id: String,
        attempts: u32,
    },
}

/// Errors that stop a partition worker.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("failed to load checkpoint for partition {partition}")]
    CheckpointLoad {
        partition: PartitionId,
        #[source]
        error: CheckpointError,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{value} is not a valid value for {option}")]
    UnknownOption { option: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
