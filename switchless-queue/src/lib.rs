/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

pub use switchless_abi::{CallId, CallStatus, SlotState, SLOT_BUFFER_SIZE};

mod backoff;
mod queue;
mod slot;
#[cfg(test)]
mod test_support;

pub use self::backoff::{BackoffPolicy, IdleBackoff};
pub use self::queue::Response;

/// A bounded queue of request slots implementing the [switchless_abi slot
/// protocol].
///
/// Any number of threads may submit calls, and any number of worker threads
/// may claim them. The slot array is never protected by a lock: every state
/// change is a single atomic operation on the slot's state word, and the rest
/// of a slot is only touched by the side that owns its current state.
///
/// **NOTE:** Clones share the same slots. The slot memory is released when
/// the last clone is dropped, so workers holding a clone may keep polling
/// until they are told to stop.
///
/// [switchless_abi slot protocol]: ../switchless_abi/enum.SlotState.html
pub struct SwitchlessQueue<O: TransitionObserver = ()> {
    inner: Arc<queue::QueueBuffer>,
    observer: O,
}

/// Receives every slot state transition, in order for any one call.
///
/// The queue is generic over its observer so that an instrumented queue can
/// record the state sequence of each call. The `()` observer does nothing and
/// is optimized away.
pub trait TransitionObserver: Clone + Send + Sync + 'static {
    fn transition(&self, slot: usize, token: u64, from: SlotState, to: SlotState);
}

impl TransitionObserver for () {
    #[inline(always)]
    fn transition(&self, _slot: usize, _token: u64, _from: SlotState, _to: SlotState) {}
}

/// Proof that the holder submitted the call in a slot. Only the holder may
/// return the slot to `Free`.
///
/// Dropping a handle without releasing it waits until the call is done and
/// then releases the slot: a submitted call always runs to completion.
pub struct SlotHandle<'q, O: TransitionObserver = ()> {
    queue: &'q SwitchlessQueue<O>,
    index: usize,
    token: u64,
    released: bool,
}

/// Proof that the holder claimed the call in a slot. Only the holder may move
/// the slot to `Done`.
///
/// Dropping a claim without completing it completes the call with
/// [`CallStatus::HandlerPanicked`], so the submitter never waits forever.
pub struct Claim<'q, O: TransitionObserver = ()> {
    queue: &'q SwitchlessQueue<O>,
    index: usize,
    token: u64,
    completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrySubmitError {
    /// No slot was `Free` after one full scan.
    QueueFull,
    /// The arguments do not fit in a slot's argument buffer.
    BufferOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryClaimError {
    Empty,
}
