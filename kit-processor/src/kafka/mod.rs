//! Kafka-backed stream source and alert channel.

pub mod alert_producer;
pub mod source;

pub use alert_producer::{create_alert_producer, KafkaAlertChannel, KafkaContext};
pub use source::{to_raw_event, KafkaStreamSource};
