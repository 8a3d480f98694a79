// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// `level` is a filter directive such as `info` or `trace_stats=debug`. Fails instead of
/// panicking when the directive does not parse or a subscriber is already installed.
pub fn init_logging(level: &str) -> Result<(), ConfigError> {
    let subscriber = build_subscriber(level)?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    debug!("Logging subsystem enabled");
    Ok(())
}

fn build_subscriber(level: &str) -> Result<impl tracing::Subscriber + Send + Sync, ConfigError> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| ConfigError::Logging(format!("could not parse log level '{level}': {e}")))?;

    Ok(tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish())
}
