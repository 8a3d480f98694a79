// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the trace stats pipeline.

use rmp::encode::ValueWriteError;

/// Configuration could not be loaded or failed validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

/// Failure of a single encoder primitive.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The text contains a character outside the single-byte range.
    #[error("Character {character:?} at offset {offset} cannot be encoded as a single byte")]
    Unencodable { character: char, offset: usize },

    #[error("Length {0} exceeds the msgpack 32-bit length limit")]
    TooLong(usize),

    #[error("Failed to write msgpack value: {0}")]
    Write(#[from] ValueWriteError<std::io::Error>),
}

/// Errors raised by [`crate::latency_summary::LatencySummary`].
#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("Cannot merge summaries with different relative accuracy")]
    IncompatibleMapping,

    #[error("Unsupported latency summary version {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed latency summary: {0}")]
    Malformed(String),

    #[error("Failed to serialize latency summary: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),
}

/// Errors reported by a [`crate::sink::Sink`].
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink rejected payload: {0}")]
    Rejected(String),

    #[error("Sink is closed")]
    Closed,
}

/// Errors reported by a [`crate::writer::MetricWriter`].
///
/// `NotOpen`, `AlreadyOpen`, `TooManyRecords` and `CountMismatch` are caller
/// contract violations; the bucket is discarded when any of them occurs.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("No bucket is open")]
    NotOpen,

    #[error("A bucket is already open")]
    AlreadyOpen,

    #[error("Bucket declared {declared} records but more were added")]
    TooManyRecords { declared: usize },

    #[error("Bucket declared {declared} records but {written} were added")]
    CountMismatch { declared: usize, written: usize },

    #[error("Failed to encode bucket: {0}")]
    Encode(#[from] EncodeError),

    #[error("Failed to deliver bucket: {0}")]
    Sink(#[from] SinkError),
}

impl WriterError {
    /// Whether the error is a violation of the writer's calling contract.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::NotOpen
                | Self::AlreadyOpen
                | Self::TooManyRecords { .. }
                | Self::CountMismatch { .. }
        )
    }
}
