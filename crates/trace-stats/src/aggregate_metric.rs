// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One cell of the aggregation table.

use crate::errors::SummaryError;
use crate::latency_summary::{LatencySummary, SummaryConfig};
use crate::metric_key::SpanOutcome;

/// Counters and latency distributions for one [`crate::metric_key::MetricKey`] within
/// one window.
///
/// Every observation increments `hit_count`. `error_count` and `top_level_count` are
/// independent counters incremented once per matching observation, so both are
/// bounded by `hit_count`. Durations feed `duration` and exactly one of the two
/// summaries depending on the error flag.
#[derive(Clone, Debug)]
pub struct AggregateMetric {
    hit_count: u64,
    error_count: u64,
    top_level_count: u64,
    duration: i64,
    ok_latencies: LatencySummary,
    error_latencies: LatencySummary,
}

impl AggregateMetric {
    #[must_use]
    pub fn new(config: SummaryConfig) -> Self {
        Self {
            hit_count: 0,
            error_count: 0,
            top_level_count: 0,
            duration: 0,
            ok_latencies: LatencySummary::new(config),
            error_latencies: LatencySummary::new(config),
        }
    }

    pub fn record(&mut self, outcome: &SpanOutcome) {
        let duration = outcome.clamped_duration();
        self.hit_count += 1;
        if outcome.is_top_level {
            self.top_level_count += 1;
        }
        self.duration = self.duration.saturating_add(duration);
        if outcome.is_error {
            self.error_count += 1;
            self.error_latencies.record_value(duration);
        } else {
            self.ok_latencies.record_value(duration);
        }
    }

    /// Adds the counters and distributions of `other`, typically a shard of the same key.
    pub fn merge_from(&mut self, other: &AggregateMetric) -> Result<(), SummaryError> {
        self.ok_latencies.merge_from(&other.ok_latencies)?;
        self.error_latencies.merge_from(&other.error_latencies)?;
        self.hit_count += other.hit_count;
        self.error_count += other.error_count;
        self.top_level_count += other.top_level_count;
        self.duration = self.duration.saturating_add(other.duration);
        Ok(())
    }

    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    #[must_use]
    pub fn top_level_count(&self) -> u64 {
        self.top_level_count
    }

    /// Sum of all observed durations in nanoseconds.
    #[must_use]
    pub fn duration(&self) -> i64 {
        self.duration
    }

    #[must_use]
    pub fn ok_latencies(&self) -> &LatencySummary {
        &self.ok_latencies
    }

    #[must_use]
    pub fn error_latencies(&self) -> &LatencySummary {
        &self.error_latencies
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hit_count == 0
    }
}
