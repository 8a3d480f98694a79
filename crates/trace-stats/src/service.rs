// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background rotation of the aggregation window.
//!
//! Two tasks cooperate:
//! - the rotation task ticks once per bucket duration, swaps the window and hands the
//!   closed bucket over a channel of capacity one;
//! - the writer task runs on the blocking pool and serializes buckets into the sink.
//!
//! ```text
//! interval tick → Aggregator::rotate → try_send ─▶ [Bucket; 1] ─▶ MetricWriter → Sink
//!                                          │
//!                                   (full: drop + count)
//! ```
//!
//! A slow sink therefore costs at most one pending bucket. The rotation task never
//! waits for the writer except for the final bucket on shutdown.

use crate::aggregator::{Aggregator, Bucket};
use crate::health::{HealthSnapshot, StatsHealth};
use crate::writer::MetricWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Closed buckets waiting for the writer. One slot bounds the backlog to a single window.
const PENDING_BUCKETS: usize = 1;
const MIN_PERIOD: Duration = Duration::from_millis(1);

pub struct RotationService<W> {
    aggregator: Arc<Aggregator>,
    writer: W,
    cancel_token: CancellationToken,
}

impl<W> RotationService<W>
where
    W: MetricWriter + Send + 'static,
{
    /// Rotates every configured bucket duration of `aggregator`.
    #[must_use]
    pub fn new(aggregator: Arc<Aggregator>, writer: W, cancel_token: CancellationToken) -> Self {
        Self {
            aggregator,
            writer,
            cancel_token,
        }
    }

    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.aggregator.health().snapshot()
    }

    /// Runs until the cancel token fires, then shuts the aggregator down, flushes the
    /// last window and waits for the writer to drain.
    pub async fn run(self) {
        let Self {
            aggregator,
            writer,
            cancel_token,
        } = self;
        let health = Arc::clone(aggregator.health());

        let (tx, rx) = mpsc::channel::<Bucket>(PENDING_BUCKETS);
        let writer_task = tokio::task::spawn_blocking(move || write_buckets(writer, rx));

        let period = aggregator.bucket_duration().max(MIN_PERIOD);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Stats rotation started with period {:?}", period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let bucket = aggregator.rotate();
                    hand_off(&tx, bucket, &health);
                }
                () = cancel_token.cancelled() => {
                    info!("Shutting down stats rotation");
                    break;
                }
            }
        }

        aggregator.shutdown();
        let bucket = aggregator.rotate();
        if !bucket.is_empty() {
            if let Err(mpsc::error::SendError(bucket)) = tx.send(bucket).await {
                error!("Stats writer stopped before the final bucket was handed off");
                health.bucket_dropped();
                health.hits_dropped(bucket.hit_count());
            }
        }
        drop(tx);

        if let Err(e) = writer_task.await {
            error!("Stats writer task failed: {}", e);
        }
        debug!("Stats rotation stopped");
    }
}

/// Passes a closed bucket to the writer without waiting.
///
/// Returns whether the bucket was queued. Empty buckets are not queued.
pub fn hand_off(tx: &mpsc::Sender<Bucket>, bucket: Bucket, health: &StatsHealth) -> bool {
    if bucket.is_empty() {
        debug!("Nothing recorded in the closed stats window");
        return false;
    }
    match tx.try_send(bucket) {
        Ok(()) => true,
        Err(TrySendError::Full(bucket)) => {
            warn!(
                "Stats writer is still busy, dropping bucket with {} keys",
                bucket.len()
            );
            health.bucket_dropped();
            health.hits_dropped(bucket.hit_count());
            false
        }
        Err(TrySendError::Closed(bucket)) => {
            error!(
                "Stats writer is gone, dropping bucket with {} keys",
                bucket.len()
            );
            health.bucket_dropped();
            health.hits_dropped(bucket.hit_count());
            false
        }
    }
}

fn write_buckets<W: MetricWriter>(mut writer: W, mut rx: mpsc::Receiver<Bucket>) {
    while let Some(bucket) = rx.blocking_recv() {
        if let Err(e) = writer.write_bucket(&bucket) {
            error!("Failed to write stats bucket: {}", e);
        }
    }
    debug!("Stats writer drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatsConfig;
    use crate::errors::SinkError;
    use crate::metric_key::{MetricKey, SpanOutcome};
    use crate::writer::{SerializingMetricWriter, WellKnownTags};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    type Delivered = Arc<Mutex<Vec<usize>>>;

    fn pipeline(
        bucket_duration: Duration,
    ) -> (
        Arc<Aggregator>,
        SerializingMetricWriter<impl crate::sink::Sink>,
        Delivered,
    ) {
        let config = StatsConfig {
            bucket_duration,
            ..Default::default()
        };
        let health = Arc::new(StatsHealth::default());
        let aggregator = Arc::new(Aggregator::new(&config, Arc::clone(&health)));
        let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
        let sink_delivered = Arc::clone(&delivered);
        let sink = move |_: usize, payload: &[u8]| -> Result<(), SinkError> {
            sink_delivered.lock().unwrap().push(payload.len());
            Ok(())
        };
        let writer = SerializingMetricWriter::new(WellKnownTags::default(), sink, 1024, health);
        (aggregator, writer, delivered)
    }

    fn bucket_with_one_key() -> Bucket {
        let config = StatsConfig::default();
        let aggregator = Aggregator::new(&config, Arc::new(StatsHealth::default()));
        aggregator.record(MetricKey::new("svc", "op", "res", "web", 200), SpanOutcome::new(1));
        aggregator.rotate()
    }

    #[test]
    #[traced_test]
    fn test_hand_off_drops_when_writer_busy() {
        let health = StatsHealth::default();
        let (tx, mut rx) = mpsc::channel(PENDING_BUCKETS);

        assert!(hand_off(&tx, bucket_with_one_key(), &health));
        assert!(!hand_off(&tx, bucket_with_one_key(), &health));
        assert_eq!(health.snapshot().buckets_dropped, 1);
        assert_eq!(health.snapshot().hits_dropped, 1);
        assert!(logs_contain("dropping bucket with 1 keys"));

        assert!(rx.try_recv().is_ok());
        assert!(hand_off(&tx, bucket_with_one_key(), &health));
        assert_eq!(health.snapshot().buckets_dropped, 1);
        assert_eq!(health.snapshot().hits_dropped, 1);
    }

    #[test]
    fn test_hand_off_skips_empty_bucket() {
        let health = StatsHealth::default();
        let (tx, mut rx) = mpsc::channel(PENDING_BUCKETS);
        let empty = Bucket {
            start: 0,
            duration: 10,
            metrics: Vec::new(),
        };
        assert!(!hand_off(&tx, empty, &health));
        assert!(rx.try_recv().is_err());
        assert_eq!(health.snapshot().buckets_dropped, 0);
        assert_eq!(health.snapshot().hits_dropped, 0);
    }

    #[test]
    fn test_hand_off_counts_closed_writer() {
        let health = StatsHealth::default();
        let (tx, rx) = mpsc::channel(PENDING_BUCKETS);
        drop(rx);
        assert!(!hand_off(&tx, bucket_with_one_key(), &health));
        assert_eq!(health.snapshot().buckets_dropped, 1);
        assert_eq!(health.snapshot().hits_dropped, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_flushes_last_window() {
        let (aggregator, writer, delivered) = pipeline(Duration::from_secs(3600));
        let cancel_token = CancellationToken::new();
        let service = RotationService::new(Arc::clone(&aggregator), writer, cancel_token.clone());
        let handle = tokio::spawn(service.run());

        let key = MetricKey::new("svc", "op", "res", "web", 200);
        for _ in 0..10 {
            aggregator.record(key, SpanOutcome::new(1_000));
        }
        cancel_token.cancel();
        handle.await.unwrap();

        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert!(aggregator.is_shutdown());
        let snapshot = aggregator.health().snapshot();
        assert_eq!(snapshot.buckets_flushed, 1);
        assert_eq!(snapshot.buckets_dropped, 0);
        assert_eq!(
            aggregator.record(key, SpanOutcome::new(1_000)),
            crate::aggregator::RecordStatus::Rejected
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_periodic_rotation_delivers_buckets() {
        let (aggregator, writer, delivered) = pipeline(Duration::from_millis(20));
        let cancel_token = CancellationToken::new();
        let service = RotationService::new(Arc::clone(&aggregator), writer, cancel_token.clone());
        let handle = tokio::spawn(service.run());

        let key = MetricKey::new("svc", "op", "res", "web", 200);
        aggregator.record(key, SpanOutcome::new(1_000));
        for _ in 0..200 {
            if !delivered.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered.lock().unwrap().len(), 1);

        cancel_token.cancel();
        handle.await.unwrap();
        // Nothing was recorded after the first rotation, so shutdown adds no payload.
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_is_shared_with_aggregator() {
        let (aggregator, writer, _) = pipeline(Duration::from_secs(3600));
        let service = RotationService::new(Arc::clone(&aggregator), writer, CancellationToken::new());
        aggregator.shutdown();
        aggregator.record(MetricKey::new("svc", "op", "res", "web", 200), SpanOutcome::new(1));
        assert_eq!(service.health().records_rejected, 1);
    }
}
