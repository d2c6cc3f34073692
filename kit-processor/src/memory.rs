//! In-memory implementations of the four capabilities the pipeline consumes, with
//! failure injection. They back the unit and scenario tests and local dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use kit_common::{AlertMessage, PartitionCheckpoint, PartitionId, RawEvent, StoredEventRecord};

use crate::alerts::AlertChannel;
use crate::checkpoint::CheckpointStore;
use crate::error::{ChannelError, CheckpointError, SourceError, StoreError};
use crate::reader::{PartitionStream, Polled, StreamSource};
use crate::store::{EventStore, UpsertOutcome};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted failures: a queue consumed one per call, then an optional permanent one.
#[derive(Debug)]
struct Failures<E> {
    next: VecDeque<E>,
    always: Option<E>,
}

impl<E> Default for Failures<E> {
    fn default() -> Self {
        Self {
            next: VecDeque::new(),
            always: None,
        }
    }
}

impl<E: Clone> Failures<E> {
    fn take(&mut self) -> Option<E> {
        self.next.pop_front().or_else(|| self.always.clone())
    }
}

// ==== Stream source ====

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<RawEvent>,
    closed: bool,
    poll_failures: VecDeque<SourceError>,
    open_failures: VecDeque<SourceError>,
}

type Logs = Arc<Mutex<HashMap<PartitionId, PartitionLog>>>;

/// A partitioned append-only log. Offsets are positions in the log, starting at 0.
#[derive(Debug, Clone)]
pub struct MemoryStreamSource {
    logs: Logs,
    idle_wait: Duration,
    rewind_on_reopen: i64,
    opens: Arc<AtomicUsize>,
}

impl Default for MemoryStreamSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamSource {
    pub fn new() -> Self {
        Self {
            logs: Default::default(),
            idle_wait: Duration::from_millis(10),
            rewind_on_reopen: 0,
            opens: Default::default(),
        }
    }

    /// How long a poll waits before reporting an idle partition.
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Start re-opened streams this many offsets before the requested one, the way
    /// a broker redelivers after a reconnect.
    pub fn with_rewind_on_reopen(mut self, rewind: i64) -> Self {
        self.rewind_on_reopen = rewind;
        self
    }

    pub fn push(
        &self,
        partition: PartitionId,
        device_id: &str,
        event_id: &str,
        payload: impl Into<Bytes>,
    ) -> i64 {
        self.push_at(partition, device_id, event_id, payload, Utc::now())
    }

    pub fn push_at(
        &self,
        partition: PartitionId,
        device_id: &str,
        event_id: &str,
        payload: impl Into<Bytes>,
        timestamp: DateTime<Utc>,
    ) -> i64 {
        let mut logs = locked(&self.logs);
        let log = logs.entry(partition).or_default();
        let offset = log.records.len() as i64;
        log.records.push(RawEvent {
            device_id: device_id.to_owned(),
            event_id: event_id.to_owned(),
            timestamp,
            payload: payload.into(),
            partition,
            partition_offset: offset,
        });
        offset
    }

    /// Streams report `Closed` once they have drained a closed partition.
    pub fn close(&self, partition: PartitionId) {
        locked(&self.logs).entry(partition).or_default().closed = true;
    }

    pub fn fail_next_polls(
        &self,
        partition: PartitionId,
        errors: impl IntoIterator<Item = SourceError>,
    ) {
        locked(&self.logs)
            .entry(partition)
            .or_default()
            .poll_failures
            .extend(errors);
    }

    pub fn fail_next_opens(
        &self,
        partition: PartitionId,
        errors: impl IntoIterator<Item = SourceError>,
    ) {
        locked(&self.logs)
            .entry(partition)
            .or_default()
            .open_failures
            .extend(errors);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSource for MemoryStreamSource {
    async fn open(
        &self,
        partition: PartitionId,
        start_offset: Option<i64>,
    ) -> Result<Box<dyn PartitionStream>, SourceError> {
        let previous_opens = self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = locked(&self.logs)
            .entry(partition)
            .or_default()
            .open_failures
            .pop_front()
        {
            return Err(error);
        }

        let mut position = start_offset.unwrap_or(0);
        if previous_opens > 0 {
            position -= self.rewind_on_reopen;
        }

        Ok(Box::new(MemoryPartitionStream {
            partition,
            logs: self.logs.clone(),
            position: usize::try_from(position).unwrap_or(0),
            idle_wait: self.idle_wait,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryPartitionStream {
    partition: PartitionId,
    logs: Logs,
    position: usize,
    idle_wait: Duration,
}

#[async_trait]
impl PartitionStream for MemoryPartitionStream {
    async fn poll(&mut self) -> Result<Polled, SourceError> {
        {
            let mut logs = locked(&self.logs);
            let log = logs.entry(self.partition).or_default();
            if let Some(error) = log.poll_failures.pop_front() {
                return Err(error);
            }
            if let Some(event) = log.records.get(self.position) {
                self.position += 1;
                return Ok(Polled::Record(event.clone()));
            }
            if log.closed {
                return Ok(Polled::Closed);
            }
        }

        tokio::time::sleep(self.idle_wait).await;
        Ok(Polled::Idle)
    }
}

// ==== Alert channel ====

#[derive(Debug, Default)]
pub struct MemoryAlertChannel {
    delivered: Mutex<Vec<AlertMessage>>,
    failures: Mutex<Failures<ChannelError>>,
    attempts: AtomicUsize,
    delay: Option<Duration>,
}

impl MemoryAlertChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes this long, for timeout tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = ChannelError>) {
        locked(&self.failures).next.extend(errors);
    }

    pub fn fail_always(&self, error: ChannelError) {
        locked(&self.failures).always = Some(error);
    }

    pub fn recover(&self) {
        *locked(&self.failures) = Failures::default();
    }

    pub fn delivered(&self) -> Vec<AlertMessage> {
        locked(&self.delivered).clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertChannel for MemoryAlertChannel {
    async fn enqueue(&self, alert: &AlertMessage) -> Result<(), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = locked(&self.failures).take() {
            return Err(error);
        }

        locked(&self.delivered).push(alert.clone());
        Ok(())
    }
}

// ==== Event store ====

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    records: Mutex<HashMap<(String, String), StoredEventRecord>>,
    failures: Mutex<Failures<StoreError>>,
    delays: Mutex<VecDeque<Duration>>,
    write_attempts: AtomicUsize,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        locked(&self.failures).next.extend(errors);
    }

    pub fn fail_always(&self, error: StoreError) {
        locked(&self.failures).always = Some(error);
    }

    pub fn recover(&self) {
        *locked(&self.failures) = Failures::default();
    }

    /// Make the next upsert hang for `delay` before answering.
    pub fn delay_next(&self, delay: Duration) {
        locked(&self.delays).push_back(delay);
    }

    /// Calls to `upsert`, including failed ones.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        locked(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<StoredEventRecord> {
        let mut records: Vec<_> = locked(&self.records).values().cloned().collect();
        records.sort_by(|a, b| {
            (&a.device_id, a.timestamp, &a.event_id).cmp(&(&b.device_id, b.timestamp, &b.event_id))
        });
        records
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert(&self, record: &StoredEventRecord) -> Result<UpsertOutcome, StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = locked(&self.delays).pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = locked(&self.failures).take() {
            return Err(error);
        }

        let key = (record.device_id.clone(), record.event_id.clone());
        let mut records = locked(&self.records);
        let outcome = match records.get(&key) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing == record => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };
        if outcome != UpsertOutcome::Unchanged {
            records.insert(key, record.clone());
        }
        Ok(outcome)
    }

    async fn get(
        &self,
        device_id: &str,
        event_id: &str,
    ) -> Result<Option<StoredEventRecord>, StoreError> {
        Ok(locked(&self.records)
            .get(&(device_id.to_owned(), event_id.to_owned()))
            .cloned())
    }

    async fn list_for_device(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredEventRecord>, StoreError> {
        Ok(self
            .records()
            .into_iter()
            .filter(|record| {
                record.device_id == device_id && record.timestamp >= from && record.timestamp < to
            })
            .collect())
    }
}

// ==== Checkpoint store ====

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    offsets: Mutex<HashMap<PartitionId, i64>>,
    history: Mutex<HashMap<PartitionId, Vec<i64>>>,
    failures: Mutex<Failures<CheckpointError>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a checkpoint, as if committed by a previous run.
    pub fn set(&self, partition: PartitionId, offset: i64) {
        locked(&self.offsets).insert(partition, offset);
    }

    pub fn get(&self, partition: PartitionId) -> Option<i64> {
        locked(&self.offsets).get(&partition).copied()
    }

    /// Every offset stored for the partition, in commit order.
    pub fn history(&self, partition: PartitionId) -> Vec<i64> {
        locked(&self.history)
            .get(&partition)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = CheckpointError>) {
        locked(&self.failures).next.extend(errors);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(
        &self,
        partition: PartitionId,
    ) -> Result<Option<PartitionCheckpoint>, CheckpointError> {
        Ok(self
            .get(partition)
            .map(|offset| PartitionCheckpoint::new(partition, offset)))
    }

    async fn commit(&self, checkpoint: PartitionCheckpoint) -> Result<(), CheckpointError> {
        if let Some(error) = locked(&self.failures).take() {
            return Err(error);
        }

        let mut offsets = locked(&self.offsets);
        let stored = offsets
            .entry(checkpoint.partition_id)
            .or_insert(checkpoint.offset);
        *stored = (*stored).max(checkpoint.offset);

        locked(&self.history)
            .entry(checkpoint.partition_id)
            .or_default()
            .push(*stored);
        Ok(())
    }
}
