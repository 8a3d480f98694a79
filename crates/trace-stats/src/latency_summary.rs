// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, mergeable latency distribution.
//!
//! Durations are recorded into a [`DDSketch`], whose quantile estimates stay within the
//! configured relative accuracy and whose store never holds more than `max_bins` bins
//! per sign; past that the lowest bins are collapsed. Memory and serialized size
//! therefore depend on the bin limit, never on the number of recorded values.
//!
//! The sketch keeps its sum as `f64`, so count and sum are tracked exactly beside it.
//!
//! # Serialized form
//!
//! A msgpack array of 6 elements:
//!
//! ```text
//! [version, relative_accuracy, max_bins, count, sum, sketch]
//! ```
//!
//! where `sketch` is the serde form of the [`DDSketch`].

use crate::errors::SummaryError;
use rmp::decode;
use sketches_ddsketch::{Config as DDSketchConfig, DDSketch};
use std::fmt;

const SERIALIZATION_VERSION: u8 = 1;
const SERIALIZED_FIELDS: u32 = 6;
/// Envelope fields plus the sketch's scalar fields, all at most 9 bytes each.
const SERIALIZED_OVERHEAD: usize = 512;
/// Durations are whole nanoseconds; anything below one is counted as zero.
const MIN_INDEXABLE_VALUE: f64 = 1.0;

pub const DEFAULT_RELATIVE_ACCURACY: f64 = 0.01;
pub const DEFAULT_MAX_BINS: usize = 2048;
/// Finer accuracies need bin keys outside the range the sketch indexes reliably.
pub const MIN_RELATIVE_ACCURACY: f64 = 1e-4;

type SerializedSummary = (u8, f64, u32, u64, i64, DDSketch);
type SerializedSummaryRef<'a> = (u8, f64, u32, u64, i64, &'a DDSketch);

/// Accuracy and memory bound shared by every summary of one aggregator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SummaryConfig {
    relative_accuracy: f64,
    max_bins: u32,
}

impl SummaryConfig {
    /// `relative_accuracy` must be in `[MIN_RELATIVE_ACCURACY, 1)` and `max_bins`
    /// non-zero; out-of-range inputs are clamped.
    #[must_use]
    pub fn new(relative_accuracy: f64, max_bins: usize) -> Self {
        let relative_accuracy = if relative_accuracy > 0.0 && relative_accuracy < 1.0 {
            relative_accuracy.max(MIN_RELATIVE_ACCURACY)
        } else {
            DEFAULT_RELATIVE_ACCURACY
        };
        Self {
            relative_accuracy,
            max_bins: u32::try_from(max_bins.max(1)).unwrap_or(u32::MAX),
        }
    }

    #[must_use]
    pub fn relative_accuracy(&self) -> f64 {
        self.relative_accuracy
    }

    #[must_use]
    pub fn max_bins(&self) -> usize {
        self.max_bins as usize
    }

    /// Upper bound of [`LatencySummary::serialize`] output for this configuration.
    #[must_use]
    pub fn max_serialized_len(&self) -> usize {
        // Positive and negative stores, each bin count at most 9 bytes.
        SERIALIZED_OVERHEAD + 2 * self.max_bins() * 9
    }

    fn sketch_config(&self) -> DDSketchConfig {
        DDSketchConfig::new(self.relative_accuracy, self.max_bins, MIN_INDEXABLE_VALUE)
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RELATIVE_ACCURACY, DEFAULT_MAX_BINS)
    }
}

#[derive(Clone)]
pub struct LatencySummary {
    config: SummaryConfig,
    count: u64,
    sum: i64,
    sketch: DDSketch,
}

impl fmt::Debug for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatencySummary")
            .field("config", &self.config)
            .field("count", &self.count)
            .field("sum", &self.sum)
            .finish_non_exhaustive()
    }
}

impl LatencySummary {
    #[must_use]
    pub fn new(config: SummaryConfig) -> Self {
        Self {
            config,
            count: 0,
            sum: 0,
            sketch: DDSketch::new(config.sketch_config()),
        }
    }

    /// Records one duration in nanoseconds. Negative values are clamped to zero.
    pub fn record_value(&mut self, duration_nanos: i64) {
        let value = duration_nanos.max(0);
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
        self.sketch.add(value as f64);
    }

    /// Adds every value recorded in `other` to this summary.
    pub fn merge_from(&mut self, other: &LatencySummary) -> Result<(), SummaryError> {
        if self.config != other.config {
            return Err(SummaryError::IncompatibleMapping);
        }
        if other.count == 0 {
            return Ok(());
        }
        self.sketch
            .merge(&other.sketch)
            .map_err(|_| SummaryError::IncompatibleMapping)?;
        self.count += other.count;
        self.sum = self.sum.saturating_add(other.sum);
        Ok(())
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn sum(&self) -> i64 {
        self.sum
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn config(&self) -> &SummaryConfig {
        &self.config
    }

    /// Estimates the value at quantile `q` in `[0, 1]`, or `None` when empty.
    #[must_use]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        self.sketch.quantile(q).ok().flatten()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SummaryError> {
        let serialized: SerializedSummaryRef<'_> = (
            SERIALIZATION_VERSION,
            self.config.relative_accuracy,
            self.config.max_bins,
            self.count,
            self.sum,
            &self.sketch,
        );
        Ok(rmp_serde::to_vec(&serialized)?)
    }

    /// Rebuilds a summary from [`LatencySummary::serialize`] output.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, SummaryError> {
        let mut header = bytes;
        let fields = decode::read_array_len(&mut header).map_err(malformed)?;
        if fields != SERIALIZED_FIELDS {
            return Err(SummaryError::Malformed(format!(
                "expected {SERIALIZED_FIELDS} fields, found {fields}"
            )));
        }
        let version: u8 = decode::read_int(&mut header).map_err(malformed)?;
        if version != SERIALIZATION_VERSION {
            return Err(SummaryError::UnsupportedVersion(version));
        }

        let (_, relative_accuracy, max_bins, count, sum, sketch): SerializedSummary =
            rmp_serde::from_slice(bytes).map_err(malformed)?;
        let config = SummaryConfig::new(relative_accuracy, max_bins as usize);
        if config.relative_accuracy != relative_accuracy || config.max_bins != max_bins {
            return Err(SummaryError::Malformed(format!(
                "unsupported mapping: accuracy {relative_accuracy}, {max_bins} bins"
            )));
        }
        if sketch.count() as u64 != count {
            return Err(SummaryError::Malformed(format!(
                "sketch holds {} values but count is {count}",
                sketch.count()
            )));
        }
        Ok(Self {
            config,
            count,
            sum,
            sketch,
        })
    }
}

fn malformed(err: impl fmt::Display) -> SummaryError {
    SummaryError::Malformed(err.to_string())
}
