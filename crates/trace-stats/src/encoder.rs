// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming msgpack encoder over a [`GrowableBuffer`].
//!
//! Maps and arrays are fixed-arity: their length header is written before the
//! elements, so the caller must know the element count up front. Integers always use
//! the smallest msgpack representation that holds the value. Text is written as
//! single-byte ISO-8859-1, which is byte-identical to ASCII for ASCII input.

use crate::buffer::GrowableBuffer;
use crate::errors::EncodeError;
use rmp::encode;

#[derive(Debug)]
pub struct StreamEncoder {
    buffer: GrowableBuffer,
}

impl StreamEncoder {
    #[must_use]
    pub fn with_capacity(initial_capacity: usize) -> Self {
        Self {
            buffer: GrowableBuffer::with_capacity(initial_capacity),
        }
    }

    pub fn start_map(&mut self, len: usize) -> Result<(), EncodeError> {
        encode::write_map_len(&mut self.buffer, to_u32(len)?)?;
        Ok(())
    }

    pub fn start_array(&mut self, len: usize) -> Result<(), EncodeError> {
        encode::write_array_len(&mut self.buffer, to_u32(len)?)?;
        Ok(())
    }

    /// Writes pre-encoded single-byte text, such as a field name constant.
    pub fn write_raw_str(&mut self, text: &[u8]) -> Result<(), EncodeError> {
        encode::write_str_len(&mut self.buffer, to_u32(text.len())?)?;
        self.buffer.put(text);
        Ok(())
    }

    /// Writes `text` as ISO-8859-1.
    ///
    /// Nothing is written when the text holds a character above U+00FF, so the caller
    /// can substitute another value in its place.
    pub fn write_text(&mut self, text: &str) -> Result<(), EncodeError> {
        if text.is_ascii() {
            return self.write_raw_str(text.as_bytes());
        }
        let latin1 = text
            .char_indices()
            .map(|(offset, character)| {
                u8::try_from(u32::from(character))
                    .map_err(|_| EncodeError::Unencodable { character, offset })
            })
            .collect::<Result<Vec<u8>, _>>()?;
        self.write_raw_str(&latin1)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), EncodeError> {
        encode::write_sint(&mut self.buffer, value)?;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), EncodeError> {
        encode::write_uint(&mut self.buffer, value)?;
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), EncodeError> {
        encode::write_f64(&mut self.buffer, value)?;
        Ok(())
    }

    pub fn write_binary(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        encode::write_bin_len(&mut self.buffer, to_u32(data.len())?)?;
        self.buffer.put(data);
        Ok(())
    }

    /// Marks the end of a completed top-level message.
    pub fn mark(&mut self) {
        self.buffer.mark();
    }

    /// Completed messages since the last reset.
    #[must_use]
    pub fn slice(&self) -> &[u8] {
        self.buffer.slice()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.buffer.message_count()
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.buffer.position()
    }

    pub fn reset(&mut self) {
        self.buffer.reset();
    }
}

fn to_u32(len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::TooLong(len))
}
