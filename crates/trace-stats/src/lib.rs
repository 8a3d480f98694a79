// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pre-aggregation and binary serialization of trace statistics.
//!
//! Completed spans are recorded into an [`aggregator::Aggregator`] keyed by
//! [`metric_key::MetricKey`]. A [`service::RotationService`] closes the window on a
//! fixed period and drives a [`writer::MetricWriter`] that frames each bucket as one
//! msgpack message for a [`sink::Sink`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregate_metric;
pub mod aggregator;
pub mod buffer;
pub mod config;
pub mod encoder;
pub mod errors;
pub mod health;
pub mod latency_summary;
pub mod logging;
pub mod metric_key;
pub mod service;
pub mod sink;
pub mod writer;
