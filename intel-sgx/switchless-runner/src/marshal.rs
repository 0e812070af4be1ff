/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The interface between the dispatch layer and generated marshaling stubs.

use std::fmt;
use std::str;

use thiserror::Error as ThisError;

use switchless_abi::{CallId, Direction, SLOT_BUFFER_SIZE};

use crate::dispatcher::CallDescriptor;

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("{len} bytes do not fit in a {capacity} byte buffer")]
    Overflow { len: usize, capacity: usize },
    #[error("expected {expected} bytes, found {actual}")]
    Length { expected: usize, actual: usize },
    #[error("malformed data: {0}")]
    Malformed(String),
}

/// One edge function, as described by its marshaling stub.
///
/// Implementations are normally generated. Arguments are serialized into a
/// zeroed buffer of exactly `ARG_SIZE` bytes, and the output into an
/// [`OutputBuffer`].
pub trait EdgeCall: 'static {
    const ID: CallId;
    const DIRECTION: Direction;
    const ARG_SIZE: usize;
    /// Whether the function may be serviced by switchless workers. When
    /// `false` the call is always trapped.
    const SWITCHLESS: bool;

    type Args;
    type Output;

    fn serialize_args(args: &Self::Args, buf: &mut [u8]) -> Result<(), MarshalError>;
    fn deserialize_args(buf: &[u8]) -> Result<Self::Args, MarshalError>;
    fn serialize_output(output: &Self::Output, out: &mut OutputBuffer) -> Result<(), MarshalError>;
    fn deserialize_output(buf: &[u8]) -> Result<Self::Output, MarshalError>;

    fn descriptor() -> CallDescriptor {
        CallDescriptor::new(Self::ID, Self::DIRECTION, Self::ARG_SIZE).switchless(Self::SWITCHLESS)
    }
}

/// Receives the marshaled output of a handler. Holds at most
/// `SLOT_BUFFER_SIZE` bytes, on either call path.
pub struct OutputBuffer {
    buf: [u8; SLOT_BUFFER_SIZE],
    len: usize,
    overflowed: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        OutputBuffer {
            buf: [0; SLOT_BUFFER_SIZE],
            len: 0,
            overflowed: false,
        }
    }

    /// Appends `data`. On overflow nothing is written and the buffer stays
    /// marked as overflowed until cleared.
    pub fn write(&mut self, data: &[u8]) -> Result<(), MarshalError> {
        let end = self.len + data.len();
        if end > SLOT_BUFFER_SIZE {
            self.overflowed = true;
            return Err(MarshalError::Overflow {
                len: end,
                capacity: SLOT_BUFFER_SIZE,
            });
        }
        self.buf[self.len..end].copy_from_slice(data);
        self.len = end;
        Ok(())
    }

    /// Writes `s` followed by a NUL byte.
    pub fn write_str(&mut self, s: &str) -> Result<(), MarshalError> {
        self.write(s.as_bytes())?;
        self.write(&[0])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.overflowed = false;
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("len", &self.len)
            .field("overflowed", &self.overflowed)
            .finish()
    }
}

/// Copies `s` into the start of `buf`. The rest of `buf` must be zero, and at
/// least one byte must remain for the terminator.
pub fn write_padded_str(s: &str, buf: &mut [u8]) -> Result<(), MarshalError> {
    if s.len() >= buf.len() {
        return Err(MarshalError::Overflow {
            len: s.len() + 1,
            capacity: buf.len(),
        });
    }
    if s.as_bytes().contains(&0) {
        return Err(MarshalError::Malformed("string contains a NUL byte".to_owned()));
    }
    buf[..s.len()].copy_from_slice(s.as_bytes());
    Ok(())
}

/// Reads a NUL-terminated UTF-8 string from the start of `buf`.
pub fn read_padded_str(buf: &[u8]) -> Result<&str, MarshalError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| MarshalError::Malformed("missing NUL terminator".to_owned()))?;
    str::from_utf8(&buf[..end]).map_err(|e| MarshalError::Malformed(e.to_string()))
}

/// Checks that `buf` is exactly `expected` bytes long.
pub fn expect_len(buf: &[u8], expected: usize) -> Result<(), MarshalError> {
    if buf.len() != expected {
        return Err(MarshalError::Length {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}
