// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters describing data the pipeline dropped or degraded.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StatsHealth {
    buckets_flushed: AtomicU64,
    buckets_dropped: AtomicU64,
    hits_dropped: AtomicU64,
    buckets_discarded: AtomicU64,
    records_rejected: AtomicU64,
    overflow_records: AtomicU64,
    field_substitutions: AtomicU64,
    sink_failures: AtomicU64,
}

/// Point-in-time copy of [`StatsHealth`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Buckets delivered to the sink.
    pub buckets_flushed: u64,
    /// Closed windows dropped because the writer was still busy with the previous one.
    pub buckets_dropped: u64,
    /// Hits carried by the dropped windows.
    pub hits_dropped: u64,
    /// Buckets discarded after a writer contract violation or encoding failure.
    pub buckets_discarded: u64,
    /// Observations rejected after shutdown.
    pub records_rejected: u64,
    /// Observations routed to the overflow cell because the window was full.
    pub overflow_records: u64,
    /// Fields written with a substitute value because they could not be encoded.
    pub field_substitutions: u64,
    pub sink_failures: u64,
}

impl StatsHealth {
    pub fn bucket_flushed(&self) {
        self.buckets_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bucket_dropped(&self) {
        self.buckets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits_dropped(&self, hits: u64) {
        self.hits_dropped.fetch_add(hits, Ordering::Relaxed);
    }

    pub fn bucket_discarded(&self) {
        self.buckets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.records_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflowed(&self) {
        self.overflow_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn field_substituted(&self) {
        self.field_substitutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sink_failed(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            buckets_flushed: self.buckets_flushed.load(Ordering::Relaxed),
            buckets_dropped: self.buckets_dropped.load(Ordering::Relaxed),
            hits_dropped: self.hits_dropped.load(Ordering::Relaxed),
            buckets_discarded: self.buckets_discarded.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            overflow_records: self.overflow_records.load(Ordering::Relaxed),
            field_substitutions: self.field_substitutions.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }
}
