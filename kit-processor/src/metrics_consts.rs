// ==== Pipeline throughput ====
/// Counter for events that completed the pipeline, labelled by severity
pub const EVENTS_PROCESSED: &str = "events_processed_total";

/// Histogram for end-to-end processing time of one event, read to checkpoint
pub const EVENT_PROCESSING_DURATION: &str = "event_processing_duration_seconds";

/// Counter for payloads that failed to parse and were stored as routine
pub const MALFORMED_PAYLOADS: &str = "malformed_payloads_total";

// ==== Deduplication ====
/// Counter for events skipped because their key was already written
pub const DEDUP_HITS: &str = "dedup_hits_total";

/// Counter for events that passed the dedup check
pub const DEDUP_MISSES: &str = "dedup_misses_total";

/// Counter for pending markers rolled back after a downstream failure
pub const DEDUP_ROLLBACKS: &str = "dedup_rollbacks_total";

// ==== Alerts ====
/// Counter for alert routing outcomes (delivered/failed/abandoned)
pub const ALERT_DELIVERIES: &str = "alert_deliveries_total";

/// Counter for individual alert channel calls
pub const ALERT_DELIVERY_ATTEMPTS: &str = "alert_delivery_attempts_total";

// ==== Event store ====
/// Counter for acknowledged upserts, labelled by outcome (inserted/unchanged/updated)
pub const STORE_UPSERTS: &str = "store_upserts_total";

/// Counter for failed store calls that will be retried
pub const STORE_WRITE_RETRIES: &str = "store_write_retries_total";

// ==== Stream source ====
/// Counter for transient read failures that were retried
pub const SOURCE_READ_RETRIES: &str = "source_read_retries_total";

/// Counter for records discarded because they were already handed out
pub const SOURCE_REDELIVERED_SKIPPED: &str = "source_redelivered_skipped_total";

// ==== Checkpoints ====
/// Counter for durable checkpoint commits, labelled by outcome
pub const CHECKPOINT_COMMITS: &str = "checkpoint_commits_total";

/// Gauge for events read but not yet committed, per partition
pub const CHECKPOINT_LAG: &str = "checkpoint_lag_events";

// ==== Supervision ====
/// Counter for escalation signals, labelled by kind
pub const ESCALATIONS: &str = "escalations_total";

/// Counter for escalation signals dropped because the channel was full
pub const ESCALATIONS_DROPPED: &str = "escalations_dropped_total";

/// Counter for partition worker restarts after a permanent failure
pub const PARTITION_RESTARTS: &str = "partition_restarts_total";
