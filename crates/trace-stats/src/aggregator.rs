// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Windowed aggregation of span outcomes.
//!
//! The open window is a [`DashMap`] behind an [`ArcSwap`]. Recorders take a strong
//! reference to the window they write into, so rotation only has to swap the pointer
//! and then wait until the closed window's last in-flight recorder lets go of it. From
//! then on the rotating thread owns the closed table outright and can drain it without
//! further synchronization.
//!
//! ```text
//! record() ──load_full──▶ Window (open) ◀──swap── rotate()
//!                                                   │
//!                            closed Window ◀────────┘ wait for recorders
//!                                 │
//!                                 ▼
//!                              Bucket ──▶ MetricWriter
//! ```

use crate::aggregate_metric::AggregateMetric;
use crate::config::StatsConfig;
use crate::health::StatsHealth;
use crate::latency_summary::SummaryConfig;
use crate::metric_key::{MetricKey, SpanOutcome};
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// How an observation was accounted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStatus {
    Recorded,
    /// The window held the maximum number of distinct keys; the observation went to
    /// the overflow cell.
    Overflowed,
    /// The aggregator is shut down.
    Rejected,
}

/// A closed window handed to the writer.
#[derive(Debug)]
pub struct Bucket {
    /// Window start in nanoseconds since the Unix epoch.
    pub start: i64,
    /// Window length in nanoseconds.
    pub duration: i64,
    pub metrics: Vec<(MetricKey, AggregateMetric)>,
}

impl Bucket {
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Total hits across all keys.
    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.metrics.iter().map(|(_, m)| m.hit_count()).sum()
    }

    #[must_use]
    pub fn get(&self, key: &MetricKey) -> Option<&AggregateMetric> {
        self.metrics.iter().find(|(k, _)| k == key).map(|(_, m)| m)
    }
}

struct Window {
    start: i64,
    table: DashMap<MetricKey, AggregateMetric>,
    /// Distinct keys admitted, excluding the overflow cell.
    keys: AtomicUsize,
    overflow_logged: AtomicBool,
}

impl Window {
    fn new(start: i64) -> Self {
        Self {
            start,
            table: DashMap::new(),
            keys: AtomicUsize::new(0),
            overflow_logged: AtomicBool::new(false),
        }
    }

    fn record(
        &self,
        key: MetricKey,
        outcome: &SpanOutcome,
        max_keys: usize,
        summary_config: SummaryConfig,
        overflow_key: MetricKey,
    ) -> RecordStatus {
        match self.table.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().record(outcome);
                return RecordStatus::Recorded;
            }
            Entry::Vacant(entry) => {
                if key == overflow_key || self.keys.fetch_add(1, Ordering::AcqRel) < max_keys {
                    entry.insert(AggregateMetric::new(summary_config)).record(outcome);
                    return RecordStatus::Recorded;
                }
                self.keys.fetch_sub(1, Ordering::AcqRel);
                // Release the shard lock before touching the overflow cell, which may
                // live in the same shard.
                drop(entry);
            }
        }

        if !self.overflow_logged.swap(true, Ordering::Relaxed) {
            warn!(
                "Stats window reached {} distinct keys, aggregating new keys into overflow",
                max_keys
            );
        }
        self.table
            .entry(overflow_key)
            .or_insert_with(|| AggregateMetric::new(summary_config))
            .record(outcome);
        RecordStatus::Overflowed
    }

    fn into_bucket(self, duration: i64) -> Bucket {
        Bucket {
            start: self.start,
            duration,
            metrics: self.table.into_iter().collect(),
        }
    }
}

pub struct Aggregator {
    current: ArcSwap<Window>,
    /// Serializes rotations. Held only around the pointer swap.
    rotation: Mutex<()>,
    max_keys: usize,
    summary_config: SummaryConfig,
    /// Interned once so the cap check on new keys does no string work.
    overflow_key: MetricKey,
    bucket_duration: Duration,
    shutdown: AtomicBool,
    health: Arc<StatsHealth>,
}

impl Aggregator {
    #[must_use]
    pub fn new(config: &StatsConfig, health: Arc<StatsHealth>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Window::new(now_nanos())),
            rotation: Mutex::new(()),
            max_keys: config.max_keys,
            summary_config: config.summary_config(),
            overflow_key: MetricKey::overflow(),
            bucket_duration: config.bucket_duration,
            shutdown: AtomicBool::new(false),
            health,
        }
    }

    /// Merges one observation into the open window.
    ///
    /// Never blocks on the writer or on I/O. After [`Aggregator::shutdown`] every call
    /// is rejected.
    pub fn record(&self, key: MetricKey, outcome: SpanOutcome) -> RecordStatus {
        // Hold a strong reference for the whole update so rotation waits for it.
        let window = self.current.load_full();
        // Checked after loading: a recorder that sees the post-shutdown window also
        // sees the flag, since both are published before the final swap.
        if self.shutdown.load(Ordering::SeqCst) {
            self.health.record_rejected();
            trace!("Rejected observation for {} after shutdown", key);
            return RecordStatus::Rejected;
        }

        let key = match outcome.http_status_code {
            Some(code) if key.http_status_code() == 0 => key.with_http_status_code(code),
            _ => key,
        };
        let status = window.record(
            key,
            &outcome,
            self.max_keys,
            self.summary_config,
            self.overflow_key,
        );
        if status == RecordStatus::Overflowed {
            self.health.record_overflowed();
        }
        status
    }

    /// Swaps in a fresh window and returns the closed one.
    ///
    /// Observations that loaded the closed window before the swap are waited for and
    /// included; observations after the swap land in the new window.
    pub fn rotate(&self) -> Bucket {
        let closed = {
            let _guard = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
            self.current.swap(Arc::new(Window::new(now_nanos())))
        };
        let window = wait_for_recorders(closed);
        let bucket = window.into_bucket(duration_nanos(self.bucket_duration));
        debug!("Rotated stats window with {} keys", bucket.len());
        bucket
    }

    /// Stops accepting observations. Call [`Aggregator::rotate`] afterwards to collect
    /// the last window.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Distinct keys in the open window, including the overflow cell.
    #[must_use]
    pub fn open_window_len(&self) -> usize {
        self.current.load().table.len()
    }

    #[must_use]
    pub fn bucket_duration(&self) -> Duration {
        self.bucket_duration
    }

    #[must_use]
    pub fn health(&self) -> &Arc<StatsHealth> {
        &self.health
    }
}

fn wait_for_recorders(mut window: Arc<Window>) -> Window {
    loop {
        match Arc::try_unwrap(window) {
            Ok(window) => return window,
            Err(shared) => {
                window = shared;
                std::thread::yield_now();
            }
        }
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, duration_nanos)
}

fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const MS: i64 = 1_000_000;

    fn aggregator(max_keys: usize) -> Aggregator {
        let config = StatsConfig {
            max_keys,
            ..StatsConfig::default()
        };
        Aggregator::new(&config, Arc::new(StatsHealth::default()))
    }

    fn web_key() -> MetricKey {
        MetricKey::new("web", "GET /x", "GET /x", "web", 200)
    }

    #[test]
    fn test_record_scenario() {
        let aggregator = aggregator(16);
        let key = web_key();
        aggregator.record(key, SpanOutcome::new(10 * MS));
        aggregator.record(key, SpanOutcome::new(20 * MS).with_error(true));
        aggregator.record(key, SpanOutcome::new(5 * MS).with_top_level(true));

        let bucket = aggregator.rotate();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.duration, 10_000_000_000);
        let aggregate = bucket.get(&key).unwrap();
        assert_eq!(aggregate.hit_count(), 3);
        assert_eq!(aggregate.error_count(), 1);
        assert_eq!(aggregate.top_level_count(), 1);
        assert_eq!(aggregate.duration(), 35 * MS);
    }

    #[test]
    fn test_rotation_starts_an_empty_window() {
        let aggregator = aggregator(16);
        aggregator.record(web_key(), SpanOutcome::new(MS));
        let first = aggregator.rotate();
        assert_eq!(first.hit_count(), 1);
        assert_eq!(aggregator.open_window_len(), 0);

        aggregator.record(web_key(), SpanOutcome::new(MS));
        let second = aggregator.rotate();
        assert_eq!(second.hit_count(), 1);
        assert!(second.start >= first.start);
    }

    #[test]
    fn test_outcome_status_fills_missing_key_status() {
        let aggregator = aggregator(16);
        let key = MetricKey::new("web", "GET", "/", "web", 0);
        aggregator.record(key, SpanOutcome::new(MS).with_http_status_code(404));
        aggregator.record(
            web_key(),
            SpanOutcome::new(MS).with_http_status_code(500),
        );

        let bucket = aggregator.rotate();
        assert!(bucket.get(&key.with_http_status_code(404)).is_some());
        assert!(bucket.get(&key).is_none());
        // A key that already carries a status keeps it.
        assert!(bucket.get(&web_key()).is_some());
    }

    #[test]
    fn test_distinct_keys_are_capped() {
        let aggregator = aggregator(2);
        let statuses: Vec<RecordStatus> = (0..5)
            .map(|i| {
                aggregator.record(
                    MetricKey::new("svc", &format!("op{i}"), "res", "web", 200),
                    SpanOutcome::new(MS),
                )
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                RecordStatus::Recorded,
                RecordStatus::Recorded,
                RecordStatus::Overflowed,
                RecordStatus::Overflowed,
                RecordStatus::Overflowed,
            ]
        );
        // Keys admitted before the cap keep aggregating normally.
        assert_eq!(
            aggregator.record(
                MetricKey::new("svc", "op0", "res", "web", 200),
                SpanOutcome::new(MS)
            ),
            RecordStatus::Recorded
        );

        let bucket = aggregator.rotate();
        assert_eq!(bucket.len(), 3);
        assert_eq!(bucket.get(&MetricKey::overflow()).unwrap().hit_count(), 3);
        assert_eq!(bucket.hit_count(), 6);
        assert_eq!(aggregator.health().snapshot().overflow_records, 3);
    }

    #[test]
    fn test_overflow_key_bypasses_cap() {
        let aggregator = aggregator(1);
        assert_eq!(
            aggregator.record(web_key(), SpanOutcome::new(MS)),
            RecordStatus::Recorded
        );
        // The catch-all cell never counts against the cap, even when recorded directly.
        for _ in 0..2 {
            assert_eq!(
                aggregator.record(MetricKey::overflow(), SpanOutcome::new(MS)),
                RecordStatus::Recorded
            );
        }
        assert_eq!(
            aggregator.record(
                MetricKey::new("svc", "other", "res", "web", 200),
                SpanOutcome::new(MS)
            ),
            RecordStatus::Overflowed
        );

        let bucket = aggregator.rotate();
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.get(&MetricKey::overflow()).unwrap().hit_count(), 3);
        assert_eq!(aggregator.health().snapshot().overflow_records, 1);
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let aggregator = aggregator(16);
        aggregator.record(web_key(), SpanOutcome::new(MS));
        aggregator.shutdown();
        assert!(aggregator.is_shutdown());
        assert_eq!(
            aggregator.record(web_key(), SpanOutcome::new(MS)),
            RecordStatus::Rejected
        );

        let bucket = aggregator.rotate();
        assert_eq!(bucket.hit_count(), 1);
        assert_eq!(aggregator.health().snapshot().records_rejected, 1);
    }

    #[test]
    fn test_rotation_is_atomic_under_concurrent_recording() {
        const THREADS: usize = 8;
        const KEYS: usize = 1000;
        const ROUNDS: usize = 5;

        let aggregator = Arc::new(aggregator(KEYS));
        let keys: Arc<Vec<MetricKey>> = Arc::new(
            (0..KEYS)
                .map(|i| MetricKey::new("svc", &format!("op{i}"), "res", "web", 200))
                .collect(),
        );

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let aggregator = Arc::clone(&aggregator);
                let keys = Arc::clone(&keys);
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        for key in keys.iter() {
                            let outcome = SpanOutcome::new(MS).with_error((t + round) % 2 == 0);
                            assert_eq!(aggregator.record(*key, outcome), RecordStatus::Recorded);
                        }
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(1));
        let first = aggregator.rotate();
        for handle in handles {
            handle.join().unwrap();
        }
        let second = aggregator.rotate();

        let expected = (THREADS * KEYS * ROUNDS) as u64;
        assert_eq!(first.hit_count() + second.hit_count(), expected);
        for key in keys.iter() {
            let hits = first.get(key).map_or(0, AggregateMetric::hit_count)
                + second.get(key).map_or(0, AggregateMetric::hit_count);
            assert_eq!(hits, (THREADS * ROUNDS) as u64);
        }
        assert_eq!(aggregator.open_window_len(), 0);
    }
}
