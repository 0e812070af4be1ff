/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::convert::TryInto;
use std::io;

use thiserror::Error as ThisError;

use switchless_abi::{CallId, CallStatus, Direction};

use crate::config::ConfigError;
use crate::marshal::MarshalError;

/// Why a single edge call failed. Only the caller of the call sees it.
#[derive(Debug, ThisError)]
pub enum CallError {
    #[error("no {} handler registered for call id {call_id}", .direction.as_str())]
    UnknownCallId { direction: Direction, call_id: CallId },
    #[error("call {call_id}: expected {expected} argument bytes, got {actual}")]
    ArgumentSizeMismatch {
        call_id: CallId,
        expected: usize,
        actual: usize,
    },
    #[error("the session is terminating")]
    SessionTerminating,
    #[error("call {call_id} failed: {message}")]
    HandlerFailed { call_id: CallId, message: String },
    #[error("call {call_id} panicked: {message}")]
    HandlerPanicked { call_id: CallId, message: String },
    #[error("call {call_id} produced more output than fits in the result buffer")]
    ResultOverflow { call_id: CallId },
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error("mode transition failed: {0:#}")]
    Transition(anyhow::Error),
    /// The callee side returned something that no well-behaved callee writes.
    #[error("call {call_id} returned corrupted status word {status:#x}")]
    Corrupted { call_id: CallId, status: u32 },
}

impl CallError {
    /// Maps a status and result buffer, as written by a dispatcher, back to
    /// the call's outcome.
    pub(crate) fn from_response(
        direction: Direction,
        call_id: CallId,
        status: u32,
        arg_len: usize,
        data: &[u8],
    ) -> Result<(), CallError> {
        let message = || String::from_utf8_lossy(data).into_owned();
        match CallStatus::from_raw(status) {
            Some(CallStatus::Success) => Ok(()),
            Some(CallStatus::HandlerFailed) => Err(CallError::HandlerFailed { call_id, message: message() }),
            Some(CallStatus::HandlerPanicked) => Err(CallError::HandlerPanicked { call_id, message: message() }),
            Some(CallStatus::UnknownCallId) => Err(CallError::UnknownCallId { direction, call_id }),
            Some(CallStatus::ArgumentSizeMismatch) => {
                let expected = data
                    .try_into()
                    .map(|b| u32::from_le_bytes(b) as usize)
                    .map_err(|_| CallError::Corrupted { call_id, status })?;
                Err(CallError::ArgumentSizeMismatch { call_id, expected, actual: arg_len })
            }
            Some(CallStatus::ResultOverflow) => Err(CallError::ResultOverflow { call_id }),
            None => Err(CallError::Corrupted { call_id, status }),
        }
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum RegisterError {
    #[error("{} call id {call_id} is already registered", .direction.as_str())]
    DuplicateCallId { direction: Direction, call_id: CallId },
    #[error("call {call_id} declares {size} argument bytes, more than a request slot holds")]
    ArgumentBufferTooLarge { call_id: CallId, size: usize },
}

/// Session creation failed. Everything created before the failure has been
/// torn down.
#[derive(Debug, ThisError)]
pub enum InitializationError {
    #[error("invalid switchless configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("failed to create enclave: {0:#}")]
    Create(anyhow::Error),
    #[error("failed to spawn {} worker thread", .direction.as_str())]
    WorkerSpawn {
        direction: Direction,
        #[source]
        source: io::Error,
    },
    #[error("enclave rejected switchless initialization: {0:#}")]
    SwitchlessInit(anyhow::Error),
    #[error(transparent)]
    Register(#[from] RegisterError),
}
