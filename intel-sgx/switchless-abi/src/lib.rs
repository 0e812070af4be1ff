/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The switchless edge-call interface describes how an untrusted host and an
//! enclave invoke functions on the other side of the trust boundary without
//! performing a mode transition for every call.
//!
//! There are two kinds of edge calls:
//!
//! 1. *ECALLs* originate on the host and are executed inside the enclave.
//! 2. *OCALLs* originate inside the enclave and are executed on the host.
//!
//! Every edge call may be serviced in one of two ways. A *trapped* call
//! performs the hardware-mediated enclave entry or exit and runs the callee
//! on the calling thread. A *switchless* call is written into a [request
//! slot] in memory shared by both sides, where a polling worker thread on the
//! other side picks it up, executes it and writes the result back.
//!
//! Both sides must agree on the layout of a slot and on the meaning of its
//! state word. This crate fully describes both. It does not describe how the
//! slots are arranged in a queue; that is up to the implementation, as long
//! as it follows the state protocol described on [`SlotState`].
//!
//! [request slot]: struct.SlotBody.html
#![no_std]
#![doc(html_logo_url = "https://edp.fortanix.com/img/docs/edp-logo.svg",
       html_favicon_url = "https://edp.fortanix.com/favicon.ico",
       html_root_url = "https://edp.fortanix.com/docs/api/")]

/// Identifies an edge function. Ids are assigned by the marshaling code
/// generator and are unique per direction within one enclave image.
pub type CallId = u32;

/// Capacity in bytes of both the argument buffer and the result buffer of a
/// request slot.
pub const SLOT_BUFFER_SIZE: usize = 1024;

/// Which way an edge call crosses the trust boundary.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Host to enclave.
    Ecall = 0,
    /// Enclave to host.
    Ocall = 1,
}

impl Direction {
    /// The direction of a call made by the callee of a call in this direction.
    pub fn reverse(self) -> Direction {
        match self {
            Direction::Ecall => Direction::Ocall,
            Direction::Ocall => Direction::Ecall,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Ecall => "ecall",
            Direction::Ocall => "ocall",
        }
    }
}

/// The state of a request slot.
///
/// The state word of a slot is the only field both sides ever access
/// concurrently. All other fields of the slot are owned by whichever side
/// owns the current state, and may only be accessed by that side.
///
/// ```text
///      submitter          worker           worker          submitter
/// Free ---------> Submitted -----> Claimed -----> Done ---------> Free
/// ```
///
/// ## Submit operation
///
/// To submit a call:
///
/// 1. Find a slot whose state word is `Free` without the [`SLOT_LEASED`] bit.
/// 2. Set the [`SLOT_LEASED`] bit with a compare-and-swap (CAS). If the CAS
///    fails, go to step 1 with the next slot. If every slot has been tried
///    once, the queue is full and the caller must use a trapped call.
/// 3. Write the call id, token and arguments.
/// 4. Store `Submitted` with release ordering.
///
/// ## Claim operation
///
/// 1. CAS a slot's state word from `Submitted` to `Claimed`, with acquire
///    ordering on success. Exactly one worker wins a given slot.
/// 2. Read the call id and arguments.
///
/// ## Complete operation
///
/// 1. Write the status and result.
/// 2. Store `Done` with release ordering.
///
/// ## Release operation
///
/// 1. Load the state word with acquire ordering. If it is not `Done`, back
///    off and retry.
/// 2. Read the status and result.
/// 3. Store `Free` with release ordering. Only the submitter of the call may
///    do this.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlotState {
    Free = 0,
    Submitted = 1,
    Claimed = 2,
    Done = 3,
}

/// Set on a `Free` state word by a submitter while it fills in the slot. A
/// leased slot is still `Free` as far as the state protocol is concerned,
/// but no other submitter may take it and no worker may claim it.
pub const SLOT_LEASED: u32 = 1 << 31;

impl SlotState {
    /// Decodes a raw state word, ignoring the lease bit.
    pub fn from_raw(raw: u32) -> Option<SlotState> {
        match raw & !SLOT_LEASED {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Submitted),
            2 => Some(SlotState::Claimed),
            3 => Some(SlotState::Done),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// The state that follows this one in the slot protocol.
    pub fn next(self) -> SlotState {
        match self {
            SlotState::Free => SlotState::Submitted,
            SlotState::Submitted => SlotState::Claimed,
            SlotState::Claimed => SlotState::Done,
            SlotState::Done => SlotState::Free,
        }
    }
}

/// Outcome of an edge call, written into the slot by the callee side.
///
/// Failures of the callee are never propagated across the boundary as
/// anything other than one of these codes, optionally followed by a UTF-8
/// message in the result buffer.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallStatus {
    /// The result buffer holds the marshaled output.
    Success = 0,
    /// The handler reported an error. The result buffer holds its message.
    HandlerFailed = 1,
    /// The handler panicked. The result buffer holds the panic message, if
    /// any.
    HandlerPanicked = 2,
    /// No handler is registered for the call id.
    UnknownCallId = 3,
    /// The argument buffer length does not match the declared size.
    ArgumentSizeMismatch = 4,
    /// The handler produced more output than fits in the result buffer.
    ResultOverflow = 5,
}

impl CallStatus {
    pub fn from_raw(raw: u32) -> Option<CallStatus> {
        match raw {
            0 => Some(CallStatus::Success),
            1 => Some(CallStatus::HandlerFailed),
            2 => Some(CallStatus::HandlerPanicked),
            3 => Some(CallStatus::UnknownCallId),
            4 => Some(CallStatus::ArgumentSizeMismatch),
            5 => Some(CallStatus::ResultOverflow),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Everything in a request slot except the state word.
///
/// The fields are plain data: they are written only by the side that owns
/// the slot's current [`SlotState`], and read only after observing the
/// state transition that follows the write.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct SlotBody {
    /// Written by the submitter.
    pub call_id: CallId,
    /// Number of valid bytes in `args`. Written by the submitter.
    pub arg_len: u32,
    /// Correlates a completion with the call that submitted it. Written by
    /// the submitter, never zero for a submitted slot.
    pub token: u64,
    /// A raw [`CallStatus`]. Written by the worker.
    pub status: u32,
    /// Number of valid bytes in `ret`. Written by the worker.
    pub ret_len: u32,
    pub args: [u8; SLOT_BUFFER_SIZE],
    pub ret: [u8; SLOT_BUFFER_SIZE],
}

impl SlotBody {
    pub const fn empty() -> SlotBody {
        SlotBody {
            call_id: 0,
            arg_len: 0,
            token: 0,
            status: 0,
            ret_len: 0,
            args: [0; SLOT_BUFFER_SIZE],
            ret: [0; SLOT_BUFFER_SIZE],
        }
    }

    /// The valid part of the argument buffer.
    pub fn args(&self) -> &[u8] {
        &self.args[..(self.arg_len as usize).min(SLOT_BUFFER_SIZE)]
    }

    /// The valid part of the result buffer.
    pub fn ret(&self) -> &[u8] {
        &self.ret[..(self.ret_len as usize).min(SLOT_BUFFER_SIZE)]
    }
}

impl Default for SlotBody {
    fn default() -> SlotBody {
        SlotBody::empty()
    }
}
