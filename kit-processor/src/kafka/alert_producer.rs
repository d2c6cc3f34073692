use std::time::Duration;

use async_trait::async_trait;
use kit_common::health::HealthHandle;
use kit_common::AlertMessage;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::alerts::AlertChannel;
use crate::config::Config;
use crate::error::ChannelError;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

pub async fn create_alert_producer(
    config: &Config,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        // At-least-once: the broker acknowledges only once replicated
        .set("acks", "all");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

/// Publishes alerts as JSON to the alerts topic, keyed by device id so one
/// device's alerts land on one partition.
pub struct KafkaAlertChannel {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    message_timeout: Duration,
}

impl KafkaAlertChannel {
    pub fn new(producer: FutureProducer<KafkaContext>, config: &Config) -> Self {
        Self {
            producer,
            topic: config.kafka_alerts_topic.clone(),
            message_timeout: Duration::from_millis(u64::from(config.kafka_message_timeout_ms)),
        }
    }

}

/// A full local queue and broker outages are retryable. Oversized or invalid
/// messages are not.
fn channel_error(error: KafkaError, message_timeout: Duration) -> ChannelError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageTimedOut) => ChannelError::Timeout(message_timeout),
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => ChannelError::Rejected(error.to_string()),
        _ => ChannelError::Unavailable(error.to_string()),
    }
}

#[async_trait]
impl AlertChannel for KafkaAlertChannel {
    async fn enqueue(&self, alert: &AlertMessage) -> Result<(), ChannelError> {
        let payload =
            serde_json::to_string(alert).map_err(|e| ChannelError::Rejected(e.to_string()))?;

        let record = FutureRecord::to(&self.topic)
            .key(&alert.device_id)
            .payload(&payload);

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| channel_error(e, self.message_timeout))?;

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(channel_error(e, self.message_timeout)),
            Err(_) => Err(ChannelError::Unavailable(
                "delivery future was cancelled".to_owned(),
            )),
        }
    }
}
