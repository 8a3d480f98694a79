// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bucket serialization.
//!
//! A bucket is written as a single msgpack message:
//!
//! ```text
//! {Hostname, Env, Version, Stats: [{Start, Duration, Stats: [Record; metric_count]}]}
//! Record = {Name, Service, Resource, Type, HTTPStatusCode, Hits, Errors,
//!           TopLevelHits, Duration, OkSummary: bin, ErrorSummary: bin}
//! ```
//!
//! The record array length is written before the first record, so the number of
//! [`MetricWriter::add`] calls must match the count given to
//! [`MetricWriter::start_bucket`]. The writer enforces that contract and discards the
//! bucket when it is broken.

use crate::aggregate_metric::AggregateMetric;
use crate::aggregator::Bucket;
use crate::encoder::StreamEncoder;
use crate::errors::{EncodeError, WriterError};
use crate::health::StatsHealth;
use crate::latency_summary::LatencySummary;
use crate::metric_key::MetricKey;
use crate::sink::Sink;
use std::sync::Arc;
use tracing::{debug, error, warn};

const HOSTNAME: &[u8] = b"Hostname";
const NAME: &[u8] = b"Name";
const ENV: &[u8] = b"Env";
const SERVICE: &[u8] = b"Service";
const RESOURCE: &[u8] = b"Resource";
const VERSION: &[u8] = b"Version";
const HITS: &[u8] = b"Hits";
const ERRORS: &[u8] = b"Errors";
const TOP_LEVEL_HITS: &[u8] = b"TopLevelHits";
const DURATION: &[u8] = b"Duration";
const TYPE: &[u8] = b"Type";
const HTTP_STATUS_CODE: &[u8] = b"HTTPStatusCode";
const START: &[u8] = b"Start";
const STATS: &[u8] = b"Stats";
const OK_SUMMARY: &[u8] = b"OkSummary";
const ERROR_SUMMARY: &[u8] = b"ErrorSummary";

const PAYLOAD_FIELDS: usize = 4;
const BUCKET_FIELDS: usize = 3;
const RECORD_FIELDS: usize = 11;

/// Tags attached to every bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WellKnownTags {
    pub hostname: String,
    pub env: String,
    pub version: String,
}

pub trait MetricWriter {
    /// Opens a bucket that will hold exactly `metric_count` records.
    fn start_bucket(&mut self, metric_count: usize, start: i64, duration: i64)
        -> Result<(), WriterError>;

    /// Appends one record to the open bucket.
    fn add(&mut self, key: &MetricKey, aggregate: &AggregateMetric) -> Result<(), WriterError>;

    /// Completes the open bucket and hands it to the sink.
    fn finish_bucket(&mut self) -> Result<(), WriterError>;

    /// Discards any partially written bucket without delivering it.
    fn reset(&mut self);

    /// Writes a whole closed window. Empty buckets are skipped.
    ///
    /// On any error the partial bucket is discarded before returning.
    fn write_bucket(&mut self, bucket: &Bucket) -> Result<(), WriterError> {
        if bucket.is_empty() {
            debug!("Skipping empty stats bucket");
            return Ok(());
        }
        let result = self
            .start_bucket(bucket.len(), bucket.start, bucket.duration)
            .and_then(|()| {
                for (key, aggregate) in &bucket.metrics {
                    self.add(key, aggregate)?;
                }
                self.finish_bucket()
            });
        if result.is_err() {
            self.reset();
        }
        result
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Idle,
    BucketOpen { declared: usize, written: usize },
}

pub struct SerializingMetricWriter<S> {
    tags: WellKnownTags,
    encoder: StreamEncoder,
    sink: S,
    state: WriterState,
    health: Arc<StatsHealth>,
}

impl<S: Sink> SerializingMetricWriter<S> {
    #[must_use]
    pub fn new(
        tags: WellKnownTags,
        sink: S,
        initial_capacity: usize,
        health: Arc<StatsHealth>,
    ) -> Self {
        Self {
            tags,
            encoder: StreamEncoder::with_capacity(initial_capacity),
            sink,
            state: WriterState::Idle,
            health,
        }
    }

    #[must_use]
    pub fn is_bucket_open(&self) -> bool {
        matches!(self.state, WriterState::BucketOpen { .. })
    }

    /// Bytes currently held in the encoder, including any unfinished bucket.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.encoder.position()
    }

    fn write_header(
        &mut self,
        metric_count: usize,
        start: i64,
        duration: i64,
    ) -> Result<(), EncodeError> {
        self.encoder.start_map(PAYLOAD_FIELDS)?;

        self.encoder.write_raw_str(HOSTNAME)?;
        write_text_or_empty(&mut self.encoder, &self.health, &self.tags.hostname)?;

        self.encoder.write_raw_str(ENV)?;
        write_text_or_empty(&mut self.encoder, &self.health, &self.tags.env)?;

        self.encoder.write_raw_str(VERSION)?;
        write_text_or_empty(&mut self.encoder, &self.health, &self.tags.version)?;

        self.encoder.write_raw_str(STATS)?;
        self.encoder.start_array(1)?;

        self.encoder.start_map(BUCKET_FIELDS)?;

        self.encoder.write_raw_str(START)?;
        self.encoder.write_i64(start)?;

        self.encoder.write_raw_str(DURATION)?;
        self.encoder.write_i64(duration)?;

        self.encoder.write_raw_str(STATS)?;
        self.encoder.start_array(metric_count)
    }

    fn write_record(
        &mut self,
        key: &MetricKey,
        aggregate: &AggregateMetric,
    ) -> Result<(), EncodeError> {
        self.encoder.start_map(RECORD_FIELDS)?;

        self.encoder.write_raw_str(NAME)?;
        write_text_or_empty(&mut self.encoder, &self.health, key.operation_name())?;

        self.encoder.write_raw_str(SERVICE)?;
        write_text_or_empty(&mut self.encoder, &self.health, key.service())?;

        self.encoder.write_raw_str(RESOURCE)?;
        write_text_or_empty(&mut self.encoder, &self.health, key.resource())?;

        self.encoder.write_raw_str(TYPE)?;
        write_text_or_empty(&mut self.encoder, &self.health, key.span_type())?;

        self.encoder.write_raw_str(HTTP_STATUS_CODE)?;
        self.encoder.write_i64(i64::from(key.http_status_code()))?;

        self.encoder.write_raw_str(HITS)?;
        self.encoder.write_u64(aggregate.hit_count())?;

        self.encoder.write_raw_str(ERRORS)?;
        self.encoder.write_u64(aggregate.error_count())?;

        self.encoder.write_raw_str(TOP_LEVEL_HITS)?;
        self.encoder.write_u64(aggregate.top_level_count())?;

        self.encoder.write_raw_str(DURATION)?;
        self.encoder.write_i64(aggregate.duration())?;

        self.encoder.write_raw_str(OK_SUMMARY)?;
        self.write_summary_or_empty(aggregate.ok_latencies())?;

        self.encoder.write_raw_str(ERROR_SUMMARY)?;
        self.write_summary_or_empty(aggregate.error_latencies())
    }

    fn write_summary_or_empty(&mut self, summary: &LatencySummary) -> Result<(), EncodeError> {
        match summary.serialize() {
            Ok(bytes) => self.encoder.write_binary(&bytes),
            Err(err) => {
                warn!("Substituting empty latency summary: {}", err);
                self.health.field_substituted();
                self.encoder.write_binary(&[])
            }
        }
    }

    fn discard(&mut self) {
        self.encoder.reset();
        self.state = WriterState::Idle;
        self.health.bucket_discarded();
    }
}

impl<S: Sink> MetricWriter for SerializingMetricWriter<S> {
    fn start_bucket(
        &mut self,
        metric_count: usize,
        start: i64,
        duration: i64,
    ) -> Result<(), WriterError> {
        if self.is_bucket_open() {
            error!("Stats bucket started while another bucket is open, discarding both");
            self.discard();
            return Err(WriterError::AlreadyOpen);
        }
        if let Err(err) = self.write_header(metric_count, start, duration) {
            error!("Failed to write stats bucket header: {}", err);
            self.discard();
            return Err(err.into());
        }
        self.state = WriterState::BucketOpen {
            declared: metric_count,
            written: 0,
        };
        Ok(())
    }

    fn add(&mut self, key: &MetricKey, aggregate: &AggregateMetric) -> Result<(), WriterError> {
        let (declared, written) = match self.state {
            WriterState::BucketOpen { declared, written } => (declared, written),
            WriterState::Idle => {
                error!("Stats record added with no open bucket");
                return Err(WriterError::NotOpen);
            }
        };
        if written >= declared {
            error!(
                "Stats bucket declared {} records but more were added, discarding bucket",
                declared
            );
            self.discard();
            return Err(WriterError::TooManyRecords { declared });
        }
        if let Err(err) = self.write_record(key, aggregate) {
            error!("Failed to write stats record for {}: {}", key, err);
            self.discard();
            return Err(err.into());
        }
        self.state = WriterState::BucketOpen {
            declared,
            written: written + 1,
        };
        Ok(())
    }

    fn finish_bucket(&mut self) -> Result<(), WriterError> {
        match self.state {
            WriterState::Idle => {
                error!("Stats bucket finished with no open bucket");
                return Err(WriterError::NotOpen);
            }
            WriterState::BucketOpen { declared, written } if declared != written => {
                error!(
                    "Stats bucket declared {} records but {} were added, discarding bucket",
                    declared, written
                );
                self.discard();
                return Err(WriterError::CountMismatch { declared, written });
            }
            WriterState::BucketOpen { .. } => {}
        }

        self.encoder.mark();
        let result = self
            .sink
            .accept(self.encoder.message_count(), self.encoder.slice());
        let size = self.encoder.slice().len();
        self.encoder.reset();
        self.state = WriterState::Idle;

        match result {
            Ok(()) => {
                debug!("Flushed stats bucket ({} bytes)", size);
                self.health.bucket_flushed();
                Ok(())
            }
            Err(err) => {
                error!("Failed to deliver stats bucket: {}", err);
                self.health.sink_failed();
                Err(err.into())
            }
        }
    }

    fn reset(&mut self) {
        if self.is_bucket_open() {
            debug!("Discarding partially written stats bucket");
            self.discard();
        } else {
            self.encoder.reset();
        }
    }
}

/// A field that cannot be encoded is written as an empty string so the rest of the
/// bucket still reaches the sink.
fn write_text_or_empty(
    encoder: &mut StreamEncoder,
    health: &StatsHealth,
    text: &str,
) -> Result<(), EncodeError> {
    match encoder.write_text(text) {
        Err(err @ EncodeError::Unencodable { .. }) => {
            warn!("Substituting empty value for stats field {:?}: {}", text, err);
            health.field_substituted();
            encoder.write_raw_str(b"")
        }
        other => other,
    }
}
