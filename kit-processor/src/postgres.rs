//! Postgres backed event store and checkpoint store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use kit_common::{PartitionCheckpoint, PartitionId, Severity, StoredEventRecord};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::error::{CheckpointError, StoreError};
use crate::store::{EventStore, UpsertOutcome};

pub async fn connect(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .acquire_timeout(config.call_timeout.0)
        .connect(&config.database_url)
        .await
}

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn upsert(&self, record: &StoredEventRecord) -> Result<UpsertOutcome, StoreError> {
        // The conditional update returns no row when the stored record is identical,
        // xmax is 0 only for freshly inserted tuples.
        let row = sqlx::query(
            r#"
INSERT INTO kit_events (device_id, event_id, timestamp, severity, malformed, payload)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (device_id, event_id) DO UPDATE SET
    timestamp = EXCLUDED.timestamp,
    severity = EXCLUDED.severity,
    malformed = EXCLUDED.malformed,
    payload = EXCLUDED.payload,
    written_at = NOW()
WHERE (kit_events.timestamp, kit_events.severity, kit_events.malformed, kit_events.payload)
    IS DISTINCT FROM (EXCLUDED.timestamp, EXCLUDED.severity, EXCLUDED.malformed, EXCLUDED.payload)
RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.device_id)
        .bind(&record.event_id)
        .bind(record.timestamp)
        .bind(record.severity.as_str())
        .bind(record.malformed)
        .bind(&record.payload[..])
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match row {
            None => Ok(UpsertOutcome::Unchanged),
            Some(row) => {
                let inserted: bool = row.try_get("inserted").map_err(store_error)?;
                if inserted {
                    Ok(UpsertOutcome::Inserted)
                } else {
                    Ok(UpsertOutcome::Updated)
                }
            }
        }
    }

    async fn get(
        &self,
        device_id: &str,
        event_id: &str,
    ) -> Result<Option<StoredEventRecord>, StoreError> {
        let row = sqlx::query(
            r#"
SELECT device_id, event_id, timestamp, severity, malformed, payload
FROM kit_events
WHERE device_id = $1 AND event_id = $2
            "#,
        )
        .bind(device_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_for_device(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredEventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT device_id, event_id, timestamp, severity, malformed, payload
FROM kit_events
WHERE device_id = $1 AND timestamp >= $2 AND timestamp < $3
ORDER BY timestamp ASC, event_id ASC
            "#,
        )
        .bind(device_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &PgRow) -> Result<StoredEventRecord, StoreError> {
    let severity: String = row.try_get("severity").map_err(store_error)?;
    let payload: Vec<u8> = row.try_get("payload").map_err(store_error)?;

    Ok(StoredEventRecord {
        device_id: row.try_get("device_id").map_err(store_error)?,
        event_id: row.try_get("event_id").map_err(store_error)?,
        timestamp: row.try_get("timestamp").map_err(store_error)?,
        severity: severity
            .parse::<Severity>()
            .map_err(|e| StoreError::Rejected(e.to_string()))?,
        malformed: row.try_get("malformed").map_err(store_error)?,
        payload: Bytes::from(payload),
    })
}

/// Connection trouble is transient. Anything the database itself refused is not.
fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some("53300") => {
            // too_many_connections
            StoreError::Throttled
        }
        e => StoreError::Rejected(e.to_string()),
    }
}

#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(
        &self,
        partition: PartitionId,
    ) -> Result<Option<PartitionCheckpoint>, CheckpointError> {
        let offset: Option<i64> = sqlx::query_scalar(
            "SELECT committed_offset FROM kit_checkpoints WHERE partition_id = $1",
        )
        .bind(partition)
        .fetch_optional(&self.pool)
        .await
        .map_err(checkpoint_error)?;

        Ok(offset.map(|offset| PartitionCheckpoint::new(partition, offset)))
    }

    async fn commit(&self, checkpoint: PartitionCheckpoint) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
INSERT INTO kit_checkpoints (partition_id, committed_offset)
VALUES ($1, $2)
ON CONFLICT (partition_id) DO UPDATE SET
    committed_offset = GREATEST(kit_checkpoints.committed_offset, EXCLUDED.committed_offset),
    updated_at = NOW()
            "#,
        )
        .bind(checkpoint.partition_id)
        .bind(checkpoint.offset)
        .execute(&self.pool)
        .await
        .map_err(checkpoint_error)?;

        Ok(())
    }
}

fn checkpoint_error(error: sqlx::Error) -> CheckpointError {
    CheckpointError::Unavailable(error.to_string())
}
