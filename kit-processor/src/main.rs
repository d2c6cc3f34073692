use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use envconfig::Envconfig;
use futures::future::ready;
use kit_common::health::HealthRegistry;
use kit_common::metrics::{serve, setup_metrics_routes};
use kit_processor::config::{Config, LogFormat};
use kit_processor::kafka::{create_alert_producer, KafkaAlertChannel, KafkaStreamSource};
use kit_processor::partition_worker::Backends;
use kit_processor::postgres::{self, PgCheckpointStore, PgEventStore};
use kit_processor::service::KitProcessorService;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing(format: LogFormat) {
    let log_layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_filter(EnvFilter::from_default_env())
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed(),
    };
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "kit processor"
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context("failed to load configuration from env")?;
    setup_tracing(config.log_format);
    info!("Starting up...");

    let liveness = HealthRegistry::new("liveness");

    let status = liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(status.get_status())));
    let router = setup_metrics_routes(router).context("failed to install metrics recorder")?;

    let http_shutdown = CancellationToken::new();
    let bind = config.bind();
    let http_server = tokio::spawn({
        let shutdown = http_shutdown.clone();
        async move {
            if let Err(e) = serve(router, &bind, shutdown).await {
                error!("Failed to serve health and metrics endpoints: {e}");
            }
        }
    });

    let pool = postgres::connect(&config)
        .await
        .context("failed to connect to postgres")?;
    postgres::migrate(&pool)
        .await
        .context("failed to run database migrations")?;

    let producer_liveness = liveness.register(
        "alert-producer".to_owned(),
        config.health_deadline(),
    );
    let producer = create_alert_producer(&config, producer_liveness)
        .await
        .context("failed to create alert producer")?;

    let backends = Backends {
        source: Arc::new(KafkaStreamSource::new(&config)),
        store: Arc::new(PgEventStore::new(pool.clone())),
        alerts: Arc::new(KafkaAlertChannel::new(producer, &config)),
        checkpoints: Arc::new(PgCheckpointStore::new(pool)),
    };

    let result = KitProcessorService::new(config, backends, liveness)?
        .run()
        .await;

    http_shutdown.cancel();
    if let Err(e) = http_server.await {
        error!("Health server task failed: {e}");
    }

    result
}
