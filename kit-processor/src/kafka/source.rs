use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use kit_common::{PartitionId, RawEvent};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::debug;

use crate::config::Config;
use crate::error::SourceError;
use crate::reader::{PartitionStream, Polled, StreamSource};

/// Device attributed to records published without a key.
pub const UNKNOWN_DEVICE: &str = "unknown";
pub const EVENT_ID_HEADER: &str = "event_id";
pub const EVENT_TIMESTAMP_HEADER: &str = "event_timestamp";

/// Reads the events topic with one assign-only consumer per partition. Offsets are
/// never committed to Kafka: checkpoints live in the checkpoint store.
pub struct KafkaStreamSource {
    client_config: ClientConfig,
    topic: String,
    poll_interval: Duration,
}

impl KafkaStreamSource {
    pub fn new(config: &Config) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            // Required by librdkafka, the consumer never joins the group
            .set("group.id", &config.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        Self {
            client_config,
            topic: config.kafka_events_topic.clone(),
            poll_interval: config.poll_interval.0,
        }
    }
}

#[async_trait]
impl StreamSource for KafkaStreamSource {
    async fn open(
        &self,
        partition: PartitionId,
        start_offset: Option<i64>,
    ) -> Result<Box<dyn PartitionStream>, SourceError> {
        let consumer: StreamConsumer = self
            .client_config
            .create()
            .map_err(|e| source_error(partition, e))?;

        let offset = match start_offset {
            Some(offset) => Offset::Offset(offset),
            None => Offset::Beginning,
        };
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&self.topic, partition, offset)
            .map_err(|e| source_error(partition, e))?;
        consumer
            .assign(&assignment)
            .map_err(|e| source_error(partition, e))?;

        debug!(
            topic = %self.topic,
            partition,
            ?offset,
            "Assigned partition consumer"
        );

        Ok(Box::new(KafkaPartitionStream {
            consumer,
            partition,
            poll_interval: self.poll_interval,
        }))
    }
}

struct KafkaPartitionStream {
    consumer: StreamConsumer,
    partition: PartitionId,
    poll_interval: Duration,
}

#[async_trait]
impl PartitionStream for KafkaPartitionStream {
    async fn poll(&mut self) -> Result<Polled, SourceError> {
        match tokio::time::timeout(self.poll_interval, self.consumer.recv()).await {
            Err(_) => Ok(Polled::Idle),
            Ok(Ok(message)) => Ok(Polled::Record(to_raw_event(&message))),
            Ok(Err(e)) => Err(source_error(self.partition, e)),
        }
    }
}

/// Map a Kafka record onto a `RawEvent`. Never fails: missing envelope fields fall
/// back to defaults derived from the record itself, so a redelivered record maps to
/// the same event.
pub fn to_raw_event<M: Message>(message: &M) -> RawEvent {
    let partition = message.partition();
    let offset = message.offset();

    let device_id = message
        .key()
        .and_then(|key| std::str::from_utf8(key).ok())
        .filter(|key| !key.is_empty())
        .unwrap_or(UNKNOWN_DEVICE)
        .to_owned();

    let event_id = header(message, EVENT_ID_HEADER)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("p{partition}-o{offset}"));

    let timestamp = header(message, EVENT_TIMESTAMP_HEADER)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|| {
            message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis)
        })
        .unwrap_or(DateTime::UNIX_EPOCH);

    RawEvent {
        device_id,
        event_id,
        timestamp,
        payload: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        partition,
        partition_offset: offset,
    }
}

fn header<'a, M: Message>(message: &'a M, name: &str) -> Option<&'a str> {
    message
        .headers()?
        .iter()
        .find(|header| header.key == name)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
}

/// Missing partitions and topics, and fatal consumer errors, are permanent. The
/// rest is retried by the reader.
fn source_error(partition: PartitionId, error: KafkaError) -> SourceError {
    let permanent = matches!(error, KafkaError::MessageConsumptionFatal(_))
        || matches!(
            error.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::UnknownPartition
                    | RDKafkaErrorCode::UnknownTopicOrPartition
                    | RDKafkaErrorCode::UnknownTopic
                    | RDKafkaErrorCode::TopicAuthorizationFailed
            )
        );

    if permanent {
        SourceError::Permanent {
            partition,
            message: error.to_string(),
        }
    } else {
        SourceError::Transient {
            partition,
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage};
    use rdkafka::Timestamp;

    use super::*;

    fn message(
        key: Option<&str>,
        headers: Option<OwnedHeaders>,
        timestamp: Timestamp,
    ) -> OwnedMessage {
        OwnedMessage::new(
            Some(br#"{"heart_rate": 72}"#.to_vec()),
            key.map(|k| k.as_bytes().to_vec()),
            "kit_events".to_owned(),
            timestamp,
            1,
            17,
            headers,
        )
    }

    fn broker_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_full_envelope() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: EVENT_ID_HEADER,
                value: Some("e1"),
            })
            .insert(Header {
                key: EVENT_TIMESTAMP_HEADER,
                value: Some("2026-09-30T08:15:00+02:00"),
            });

        let event = to_raw_event(
            &message(Some("kit-42"), Some(headers), Timestamp::CreateTime(1)),
        );

        assert_eq!(event.device_id, "kit-42");
        assert_eq!(event.event_id, "e1");
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2026, 9, 30, 6, 15, 0).unwrap()
        );
        assert_eq!(event.partition, 1);
        assert_eq!(event.partition_offset, 17);
        assert_eq!(&event.payload[..], br#"{"heart_rate": 72}"#);
    }

    #[test]
    fn test_missing_envelope_fields_fall_back() {
        let event = to_raw_event(&message(None, None, Timestamp::NotAvailable));

        assert_eq!(event.device_id, UNKNOWN_DEVICE);
        assert_eq!(event.event_id, "p1-o17");
        assert_eq!(event.timestamp, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_redelivered_record_without_timestamps_maps_to_same_event() {
        let record = message(Some("kit-5"), None, Timestamp::NotAvailable);

        let first = to_raw_event(&record);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let redelivered = to_raw_event(&record);

        assert_eq!(first, redelivered);
    }

    #[test]
    fn test_broker_timestamp_used_without_header() {
        let headers = OwnedHeaders::new().insert(Header {
            key: EVENT_TIMESTAMP_HEADER,
            value: Some("not a timestamp"),
        });
        let millis = broker_time().timestamp_millis();

        let event = to_raw_event(
            &message(Some("kit-1"), Some(headers), Timestamp::LogAppendTime(millis)),
        );

        assert_eq!(event.timestamp.timestamp_millis(), millis);
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            source_error(0, KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownPartition)),
            SourceError::Permanent { .. }
        ));
        assert!(matches!(
            source_error(
                0,
                KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownTopicOrPartition)
            ),
            SourceError::Permanent { .. }
        ));
        assert!(matches!(
            source_error(0, KafkaError::Global(RDKafkaErrorCode::AllBrokersDown)),
            SourceError::Transient { .. }
        ));
        assert!(matches!(
            source_error(
                0,
                KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut)
            ),
            SourceError::Transient { .. }
        ));
    }
}
