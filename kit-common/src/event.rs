//! # Event
//!
//! Types that flow through the kit telemetry pipeline, from the raw stream record
//! to the row persisted in the event store.
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier of a stream partition.
pub type PartitionId = i32;

/// A sensor event as read from one stream partition. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub device_id: String,
    /// Unique per device, but may repeat across redeliveries.
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Bytes,
    pub partition: PartitionId,
    pub partition_offset: i64,
}

/// Severity assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Routine,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Routine => "routine",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSeverityError(pub String);

impl fmt::Display for ParseSeverityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not a valid Severity", self.0)
    }
}

impl std::error::Error for ParseSeverityError {}

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Severity::Critical),
            "routine" => Ok(Severity::Routine),
            invalid => Err(ParseSeverityError(invalid.to_owned())),
        }
    }
}

/// Derive the dedup key of an event: hex SHA-256 over the length-prefixed device id
/// followed by the event id.
///
/// The length prefix keeps `("ab", "c")` and `("a", "bc")` apart.
pub fn dedup_key(device_id: &str, event_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((device_id.len() as u64).to_be_bytes());
    hasher.update(device_id.as_bytes());
    hasher.update(event_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A `RawEvent` with the classifier's verdict attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    pub event: RawEvent,
    pub severity: Severity,
    pub dedup_key: String,
    /// Set when the payload could not be parsed. Such events are always `Routine`.
    pub malformed: bool,
    /// Why the policy flagged the event as critical.
    pub reason: Option<String>,
}

impl ClassifiedEvent {
    pub fn device_id(&self) -> &str {
        &self.event.device_id
    }

    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    pub fn offset(&self) -> i64 {
        self.event.partition_offset
    }

    /// The record to upsert into the event store. Every classified event has one.
    pub fn to_record(&self) -> StoredEventRecord {
        StoredEventRecord {
            device_id: self.event.device_id.clone(),
            event_id: self.event.event_id.clone(),
            timestamp: self.event.timestamp,
            severity: self.severity,
            malformed: self.malformed,
            payload: self.event.payload.clone(),
        }
    }

    /// The alert for this event, only produced for `Critical` events.
    pub fn to_alert(&self) -> Option<AlertMessage> {
        if !self.severity.is_critical() {
            return None;
        }

        Some(AlertMessage {
            device_id: self.event.device_id.clone(),
            event_id: self.event.event_id.clone(),
            timestamp: self.event.timestamp,
            reason: self
                .reason
                .clone()
                .unwrap_or_else(|| "critical event".to_owned()),
        })
    }
}

/// Message published on the alert channel. Consumers must be idempotent on
/// `(device_id, event_id)`, since delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub device_id: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// One logical row per `(device_id, event_id)` in the event store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEventRecord {
    /// Store partition key. Independent from the stream partition.
    pub device_id: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub malformed: bool,
    pub payload: Bytes,
}

/// Durable read position of one stream partition: the last fully processed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCheckpoint {
    pub partition_id: PartitionId,
    pub offset: i64,
}

impl PartitionCheckpoint {
    pub fn new(partition_id: PartitionId, offset: i64) -> Self {
        Self {
            partition_id,
            offset,
        }
    }

    /// The offset to resume reading from after a restart.
    pub fn resume_offset(&self) -> i64 {
        self.offset + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(device_id: &str, event_id: &str) -> RawEvent {
        RawEvent {
            device_id: device_id.to_owned(),
            event_id: event_id.to_owned(),
            timestamp: Utc::now(),
            payload: Bytes::from_static(b"{}"),
            partition: 0,
            partition_offset: 7,
        }
    }

    #[test]
    fn test_dedup_key_is_deterministic() {
        assert_eq!(dedup_key("kit-42", "e1"), dedup_key("kit-42", "e1"));
        assert_eq!(dedup_key("kit-42", "e1").len(), 64);
    }

    #[test]
    fn test_dedup_key_separates_ambiguous_concatenations() {
        assert_ne!(dedup_key("ab", "c"), dedup_key("a", "bc"));
        assert_ne!(dedup_key("kit-42", "e1"), dedup_key("kit-42", "e2"));
        assert_ne!(dedup_key("kit-41", "e1"), dedup_key("kit-42", "e1"));
    }

    #[test]
    fn test_severity_round_trips_through_str() {
        assert_eq!("critical".parse::<Severity>(), Ok(Severity::Critical));
        assert_eq!("routine".parse::<Severity>(), Ok(Severity::Routine));
        assert!("urgent".parse::<Severity>().is_err());
        assert_eq!(Severity::Critical.to_string(), "critical");
    }

    #[test]
    fn test_routine_events_have_no_alert() {
        let classified = ClassifiedEvent {
            event: raw("kit-1", "e1"),
            severity: Severity::Routine,
            dedup_key: dedup_key("kit-1", "e1"),
            malformed: false,
            reason: None,
        };

        assert!(classified.to_alert().is_none());
        let record = classified.to_record();
        assert_eq!(record.severity, Severity::Routine);
        assert_eq!(record.device_id, "kit-1");
    }

    #[test]
    fn test_critical_events_carry_reason_into_alert() {
        let classified = ClassifiedEvent {
            event: raw("kit-42", "e1"),
            severity: Severity::Critical,
            dedup_key: dedup_key("kit-42", "e1"),
            malformed: false,
            reason: Some("fall detected".to_owned()),
        };

        let alert = classified.to_alert().unwrap();
        assert_eq!(alert.event_id, "e1");
        assert_eq!(alert.device_id, "kit-42");
        assert_eq!(alert.reason, "fall detected");
    }

    #[test]
    fn test_alert_message_serializes_with_snake_case_fields() {
        let alert = AlertMessage {
            device_id: "kit-42".to_owned(),
            event_id: "e1".to_owned(),
            timestamp: Utc::now(),
            reason: "spo2 80 below 88".to_owned(),
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["device_id"], "kit-42");
        assert_eq!(json["event_id"], "e1");
    }

    #[test]
    fn test_checkpoint_resumes_after_committed_offset() {
        assert_eq!(PartitionCheckpoint::new(1, 41).resume_offset(), 42);
    }
}
