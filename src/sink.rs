//! Sink contract and shared write-retry driver (spec §4.5, §6.3)

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{CollectorError, Result};
use crate::model::Point;

/// The boundary between the core and a persistence backend. Concrete
/// TSDB/Prometheus implementations live outside this crate.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn init(&self) -> Result<()>;
    async fn write_points(&self, points: &[Point]) -> Result<()>;
}

/// Exponential-backoff parameters for a write-retry loop (spec §4.5 for the
/// sink driver, §4.2/§4.4 for the client's own retry loops, which reuse this
/// shape with different constants rather than duplicating the loop).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// 0 or negative means unbounded retry.
    pub max_retries: i64,
}

impl RetryPolicy {
    /// Sink write-retry defaults (spec §4.5: initial 5s, clamp 1280s).
    pub fn sink_default(max_retries: i64) -> Self {
        RetryPolicy {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(1280),
            max_retries,
        }
    }

    /// Per-tick data-fetch retry defaults (spec §4.4: initial 10s, clamp
    /// 1280s, retried forever regardless of the run-level max-retries).
    pub fn data_fetch_default() -> Self {
        RetryPolicy {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(1280),
            max_retries: 0,
        }
    }
}

/// Write `points` to `sink`, retrying on failure per `policy` (spec §4.5).
/// Returns the sink's final error once retries are exhausted.
pub async fn write_with_retry(
    sink: &dyn Sink,
    points: &[Point],
    policy: RetryPolicy,
) -> Result<()> {
    let mut delay = policy.initial;
    let mut attempt: i64 = 0;
    loop {
        match sink.write_points(points).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if policy.max_retries > 0 && attempt >= policy.max_retries {
                    warn!(error = %e, attempts = attempt, "sink write retries exhausted");
                    return Err(e);
                }
                debug!(error = %e, delay = ?delay, attempt, "sink write failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max);
            }
        }
    }
}

/// Discards everything. Used in this crate's own tests and doc examples.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn write_points(&self, _points: &[Point]) -> Result<()> {
        Ok(())
    }
}

/// Forwards each written batch over an mpsc channel, for integration tests
/// asserting on exactly what a worker would have written.
#[derive(Clone)]
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<Vec<Point>>,
}

impl ChannelSink {
    pub fn new(tx: tokio::sync::mpsc::Sender<Vec<Point>>) -> Self {
        ChannelSink { tx }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn write_points(&self, points: &[Point]) -> Result<()> {
        self.tx
            .send(points.to_vec())
            .await
            .map_err(|e| CollectorError::SinkError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakySink {
        failures_remaining: AtomicUsize,
    }

    #[async_trait]
    impl Sink for FlakySink {
        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn write_points(&self, _points: &[Point]) -> Result<()> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(CollectorError::SinkError("transient".into()));
            }
            Ok(())
        }
    }

    struct AlwaysFailsSink;

    #[async_trait]
    impl Sink for AlwaysFailsSink {
        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn write_points(&self, _points: &[Point]) -> Result<()> {
            Err(CollectorError::SinkError("permanent".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let sink = FlakySink {
            failures_remaining: AtomicUsize::new(2),
        };
        let policy = RetryPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(10),
            max_retries: 0,
        };
        let result = write_with_retry(&sink, &[], policy).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let sink = AlwaysFailsSink;
        let policy = RetryPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            max_retries: 3,
        };
        let result = write_with_retry(&sink, &[], policy).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn channel_sink_forwards_batches() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let sink = ChannelSink::new(tx);
        let points = vec![Point::new("p", 0, vec![Default::default()], vec![Default::default()])];
        sink.write_points(&points).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].name, "p");
    }

    #[test]
    fn null_sink_is_send_sync() {
        fn assert_bounds<T: Send + Sync>() {}
        assert_bounds::<NullSink>();
        assert_bounds::<Arc<dyn Sink>>();
    }
}
