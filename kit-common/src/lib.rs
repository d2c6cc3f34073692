pub mod event;
pub mod health;
pub mod metrics;
pub mod retry;

pub use event::{
    dedup_key, AlertMessage, ClassifiedEvent, PartitionCheckpoint, PartitionId, RawEvent,
    Severity, StoredEventRecord,
};
pub use retry::RetryPolicy;
