// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consumers of finished buckets.
//!
//! A [`Sink`] receives a borrowed view into the writer's buffer. The writer reuses
//! that buffer as soon as `accept` returns, so a sink that needs the bytes later must
//! copy them.

use crate::errors::SinkError;
use tokio::sync::mpsc;
use tracing::debug;

pub trait Sink: Send {
    /// Takes one finished payload holding `record_count` top-level messages.
    fn accept(&mut self, record_count: usize, payload: &[u8]) -> Result<(), SinkError>;
}

impl<F> Sink for F
where
    F: FnMut(usize, &[u8]) -> Result<(), SinkError> + Send,
{
    fn accept(&mut self, record_count: usize, payload: &[u8]) -> Result<(), SinkError> {
        self(record_count, payload)
    }
}

/// An owned copy of a delivered payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    pub record_count: usize,
    pub bytes: Vec<u8>,
}

/// Forwards payloads to an async transport over a bounded channel.
///
/// `accept` blocks while the channel is full, pushing backpressure onto the writer
/// rather than dropping data. It must run outside of an async context, for example on
/// the blocking writer task of [`crate::service::RotationService`].
pub struct ChannelSink {
    tx: mpsc::Sender<Payload>,
}

impl ChannelSink {
    /// Creates the sink and the receiving end for the transport.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Sink for ChannelSink {
    fn accept(&mut self, record_count: usize, payload: &[u8]) -> Result<(), SinkError> {
        debug!(
            "Forwarding stats payload with {} records ({} bytes)",
            record_count,
            payload.len()
        );
        self.tx
            .blocking_send(Payload {
                record_count,
                bytes: payload.to_vec(),
            })
            .map_err(|_| SinkError::Closed)
    }
}
