//! Partition Reader - ordered, restartable reads from a single stream partition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kit_common::{PartitionId, RawEvent, RetryPolicy};
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::metrics_consts::{SOURCE_READ_RETRIES, SOURCE_REDELIVERED_SKIPPED};

/// Result of a single poll on a partition stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Polled {
    Record(RawEvent),
    /// Nothing arrived within the poll interval.
    Idle,
    /// The partition is closed and fully drained.
    Closed,
}

/// A partitioned, ordered, at-least-once stream.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Open one partition positioned at `start_offset`, or at its beginning when `None`.
    async fn open(
        &self,
        partition: PartitionId,
        start_offset: Option<i64>,
    ) -> Result<Box<dyn PartitionStream>, SourceError>;
}

#[async_trait]
pub trait PartitionStream: Send + Sync {
    async fn poll(&mut self) -> Result<Polled, SourceError>;
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub retry_policy: RetryPolicy,
    pub timeout: Duration,
}

/// Hands out the records of one partition strictly in offset order, exactly once
/// per reader. Transient failures re-open the stream at the next expected offset.
pub struct PartitionReader {
    partition: PartitionId,
    source: Arc<dyn StreamSource>,
    stream: Option<Box<dyn PartitionStream>>,
    next_offset: Option<i64>,
    config: ReaderConfig,
    consecutive_failures: u32,
}

impl PartitionReader {
    pub fn new(
        partition: PartitionId,
        source: Arc<dyn StreamSource>,
        start_offset: Option<i64>,
        config: ReaderConfig,
    ) -> Self {
        Self {
            partition,
            source,
            stream: None,
            next_offset: start_offset,
            config,
            consecutive_failures: 0,
        }
    }

    /// Offset the next record is expected at, `None` until the first record when
    /// reading from the beginning.
    pub fn next_offset(&self) -> Option<i64> {
        self.next_offset
    }

    /// Wait for the next record. Transient failures and timeouts are retried with
    /// backoff and never returned; a permanent error is returned as is.
    ///
    /// Dropping the returned future is safe: nothing is handed out until it resolves.
    pub async fn next(&mut self) -> Result<Polled, SourceError> {
        loop {
            if self.stream.is_none() {
                match self.open().await {
                    Ok(stream) => self.stream = Some(stream),
                    Err(error) => {
                        self.backoff(error).await?;
                        continue;
                    }
                }
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };

            let polled = tokio::time::timeout(self.config.timeout, stream.poll())
                .await
                .unwrap_or(Err(SourceError::Timeout {
                    partition: self.partition,
                    timeout: self.config.timeout,
                }));

            match polled {
                Ok(Polled::Record(event)) => {
                    if let Some(next_offset) = self.next_offset {
                        if event.partition_offset < next_offset {
                            debug!(
                                partition = self.partition,
                                offset = event.partition_offset,
                                next_offset,
                                "Discarding record already handed out"
                            );
                            metrics::counter!(SOURCE_REDELIVERED_SKIPPED).increment(1);
                            continue;
                        }
                    }

                    self.consecutive_failures = 0;
                    self.next_offset = Some(event.partition_offset + 1);
                    return Ok(Polled::Record(event));
                }
                Ok(Polled::Idle) => {
                    self.consecutive_failures = 0;
                    return Ok(Polled::Idle);
                }
                Ok(Polled::Closed) => {
                    info!(partition = self.partition, "Partition closed");
                    return Ok(Polled::Closed);
                }
                Err(error) => {
                    self.stream = None;
                    self.backoff(error).await?;
                }
            }
        }
    }

    async fn open(&self) -> Result<Box<dyn PartitionStream>, SourceError> {
        debug!(
            partition = self.partition,
            start_offset = ?self.next_offset,
            "Opening partition stream"
        );

        tokio::time::timeout(
            self.config.timeout,
            self.source.open(self.partition, self.next_offset),
        )
        .await
        .unwrap_or(Err(SourceError::Timeout {
            partition: self.partition,
            timeout: self.config.timeout,
        }))
    }

    async fn backoff(&mut self, error: SourceError) -> Result<(), SourceError> {
        if !error.is_transient() {
            return Err(error);
        }

        self.consecutive_failures += 1;
        metrics::counter!(SOURCE_READ_RETRIES).increment(1);

        let interval = self
            .config
            .retry_policy
            .retry_interval(self.consecutive_failures);
        warn!(
            partition = self.partition,
            next_offset = ?self.next_offset,
            attempts = self.consecutive_failures,
            error = %error,
            retry_in = ?interval,
            "Partition read failed, reopening"
        );
        tokio::time::sleep(interval).await;

        Ok(())
    }
}

impl std::fmt::Debug for PartitionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionReader")
            .field("partition", &self.partition)
            .field("next_offset", &self.next_offset)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStreamSource;

    fn reader(source: &MemoryStreamSource, start_offset: Option<i64>) -> PartitionReader {
        PartitionReader::new(
            0,
            Arc::new(source.clone()),
            start_offset,
            ReaderConfig {
                retry_policy: RetryPolicy::build(2, Duration::from_millis(100))
                    .maximum_interval(Duration::from_secs(10))
                    .provide(),
                timeout: Duration::from_secs(5),
            },
        )
    }

    async fn drain(reader: &mut PartitionReader) -> Vec<(String, i64)> {
        let mut read = Vec::new();
        loop {
            match reader.next().await.unwrap() {
                Polled::Record(event) => read.push((event.event_id, event.partition_offset)),
                Polled::Idle => continue,
                Polled::Closed => return read,
            }
        }
    }

    fn transient() -> SourceError {
        SourceError::Transient {
            partition: 0,
            message: "broker transport failure".to_owned(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_in_order_from_start_offset() {
        let source = MemoryStreamSource::new();
        for i in 0..5 {
            source.push(0, "kit-1", &format!("e{i}"), "{}");
        }
        source.close(0);

        let mut reader = reader(&source, Some(2));

        assert_eq!(
            drain(&mut reader).await,
            vec![
                ("e2".to_owned(), 2),
                ("e3".to_owned(), 3),
                ("e4".to_owned(), 4)
            ]
        );
        assert_eq!(reader.next_offset(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_reopen_without_skipping_or_repeating() {
        let source = MemoryStreamSource::new().with_rewind_on_reopen(2);
        for i in 0..4 {
            source.push(0, "kit-1", &format!("e{i}"), "{}");
        }
        source.close(0);

        let mut reader = reader(&source, None);
        assert!(matches!(reader.next().await.unwrap(), Polled::Record(_)));
        assert!(matches!(reader.next().await.unwrap(), Polled::Record(_)));

        source.fail_next_polls(0, [transient(), transient()]);
        source.fail_next_opens(0, [transient()]);

        let rest = drain(&mut reader).await;
        assert_eq!(rest, vec![("e2".to_owned(), 2), ("e3".to_owned(), 3)]);
        // initial open, then one per failed poll, plus the failed open
        assert_eq!(source.opens(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_returned() {
        let source = MemoryStreamSource::new();
        source.push(0, "kit-1", "e0", "{}");
        let permanent = SourceError::Permanent {
            partition: 0,
            message: "partition deleted".to_owned(),
        };
        source.fail_next_polls(0, [transient(), permanent.clone()]);

        let mut reader = reader(&source, None);

        assert_eq!(reader.next().await, Err(permanent));
    }

    #[test]
    fn test_reader_future_is_send() {
        fn assert_send<T: Send>(_: T) {}

        let source = MemoryStreamSource::new();
        let mut reader = reader(&source, None);
        assert_send(reader.next());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_partition_reports_idle() {
        let source = MemoryStreamSource::new();
        let mut reader = reader(&source, None);

        assert_eq!(reader.next().await, Ok(Polled::Idle));

        source.push(0, "kit-1", "e0", "{}");
        assert!(matches!(reader.next().await, Ok(Polled::Record(_))));
    }
}
