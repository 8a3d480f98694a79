// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation identity and per-span observations.
//!
//! A [`MetricKey`] names one cell of the aggregation table. Its string dimensions are
//! interned with [`ustr`], so keys are `Copy`, hash by pointer-sized values, and can be
//! shared between recorder threads without allocation.

use std::fmt;
use ustr::Ustr;

/// Operation name of the catch-all cell used once the distinct-key cap is reached.
pub const OVERFLOW_OPERATION_NAME: &str = "_dd.stats.overflow";

/// Immutable identity of one aggregation cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MetricKey {
    service: Ustr,
    operation_name: Ustr,
    resource: Ustr,
    span_type: Ustr,
    http_status_code: u16,
}

impl MetricKey {
    #[must_use]
    pub fn new(
        service: &str,
        operation_name: &str,
        resource: &str,
        span_type: &str,
        http_status_code: u16,
    ) -> Self {
        Self {
            service: Ustr::from(service),
            operation_name: Ustr::from(operation_name),
            resource: Ustr::from(resource),
            span_type: Ustr::from(span_type),
            http_status_code,
        }
    }

    /// The catch-all key new dimension combinations collapse into when a window is full.
    #[must_use]
    pub fn overflow() -> Self {
        Self::new("", OVERFLOW_OPERATION_NAME, "", "", 0)
    }

    /// Returns a copy of this key with a different HTTP status dimension.
    #[must_use]
    pub fn with_http_status_code(self, http_status_code: u16) -> Self {
        Self {
            http_status_code,
            ..self
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        self.service.as_str()
    }

    #[must_use]
    pub fn operation_name(&self) -> &str {
        self.operation_name.as_str()
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        self.resource.as_str()
    }

    #[must_use]
    pub fn span_type(&self) -> &str {
        self.span_type.as_str()
    }

    /// HTTP status code, `0` when the span carried none.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        self.http_status_code
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.service, self.operation_name, self.resource, self.span_type, self.http_status_code
        )
    }
}

/// Outcome of one finished span, as supplied by the span lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpanOutcome {
    pub is_error: bool,
    pub is_top_level: bool,
    /// Span duration in nanoseconds. Negative values are clamped to zero.
    pub duration_nanos: i64,
    /// Status code observed on the span. Fills the key's HTTP status dimension when
    /// the key carries none.
    pub http_status_code: Option<u16>,
}

impl SpanOutcome {
    #[must_use]
    pub fn new(duration_nanos: i64) -> Self {
        Self {
            duration_nanos,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    #[must_use]
    pub fn with_top_level(mut self, is_top_level: bool) -> Self {
        self.is_top_level = is_top_level;
        self
    }

    #[must_use]
    pub fn with_http_status_code(mut self, http_status_code: u16) -> Self {
        self.http_status_code = Some(http_status_code);
        self
    }

    /// Duration clamped to the non-negative range.
    #[must_use]
    pub fn clamped_duration(&self) -> i64 {
        self.duration_nanos.max(0)
    }
}
