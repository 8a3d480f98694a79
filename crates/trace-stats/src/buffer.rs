// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reusable byte buffer backing the stream encoder.
//!
//! The buffer tracks a `mark` at the end of the most recently completed top-level
//! message. [`GrowableBuffer::slice`] exposes everything up to the mark without copying,
//! and [`GrowableBuffer::reset`] rewinds the write cursor while keeping the allocation so
//! the next bucket reuses it.

use std::io;

#[derive(Debug)]
pub struct GrowableBuffer {
    bytes: Vec<u8>,
    mark: usize,
    message_count: usize,
}

impl GrowableBuffer {
    #[must_use]
    pub fn with_capacity(initial_capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(initial_capacity),
            mark: 0,
            message_count: 0,
        }
    }

    /// Appends bytes at the write cursor, growing the backing storage when needed.
    pub fn put(&mut self, data: &[u8]) {
        // Vec doubles its capacity, which keeps growth amortized O(1) per byte.
        self.bytes.extend_from_slice(data);
    }

    /// Records the current write position as the end of a completed message.
    pub fn mark(&mut self) {
        self.mark = self.bytes.len();
        self.message_count += 1;
    }

    /// Completed messages up to the last mark. Valid until the next `reset`.
    #[must_use]
    pub fn slice(&self) -> &[u8] {
        &self.bytes[..self.mark]
    }

    /// Number of messages completed since the last reset.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// Bytes written since the last reset, including any unmarked tail.
    #[must_use]
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    /// Rewinds the buffer to empty, keeping the allocation.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.mark = 0;
        self.message_count = 0;
    }
}

impl io::Write for GrowableBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.put(buf);
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.put(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
