/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use switchless_abi::{SlotBody, SlotState, SLOT_LEASED};

const FREE: u32 = SlotState::Free as u32;
const LEASED: u32 = FREE | SLOT_LEASED;
const SUBMITTED: u32 = SlotState::Submitted as u32;
const CLAIMED: u32 = SlotState::Claimed as u32;
const DONE: u32 = SlotState::Done as u32;

/// The state word of a slot.
///
/// Each operation documents its memory ordering. Together they guarantee that
/// a thread observing a state also observes every write made to the slot body
/// by the owner of the previous state.
pub(crate) struct StateCell(AtomicU32);

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell(AtomicU32::new(FREE))
    }

    /// Acquire load. A leased slot reads as `Free`.
    pub(crate) fn load(&self) -> SlotState {
        let raw = self.0.load(Ordering::Acquire);
        SlotState::from_raw(raw).unwrap_or_else(|| panic!("corrupted slot state word {:#x}", raw))
    }

    /// `Free` to leased `Free`. Acquire on success, so the new submitter sees
    /// the slot as the previous submitter left it.
    pub(crate) fn try_lease(&self) -> bool {
        self.0
            .compare_exchange(FREE, LEASED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Leased `Free` to `Submitted`. Release, publishing the arguments.
    /// Must only be called by the holder of the lease.
    pub(crate) fn publish_submitted(&self) {
        self.transition(LEASED, SUBMITTED);
    }

    /// `Submitted` to `Claimed`. Acquire on success, so the worker sees the
    /// arguments; release, so the claim is ordered before the result writes.
    pub(crate) fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(SUBMITTED, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// `Claimed` to `Done`. Release, publishing the result. Must only be
    /// called by the worker holding the claim.
    pub(crate) fn publish_done(&self) {
        self.transition(CLAIMED, DONE);
    }

    /// `Done` to `Free`. Release on success, so the next submitter sees the
    /// slot after the result has been consumed. Must only be called by the
    /// submitter of the call.
    pub(crate) fn try_free(&self) -> bool {
        self.0
            .compare_exchange(DONE, FREE, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    fn transition(&self, from: u32, to: u32) {
        if let Err(actual) = self.0.compare_exchange(from, to, Ordering::Release, Ordering::Relaxed) {
            panic!(
                "slot protocol violated: expected state word {:#x}, found {:#x}",
                from, actual
            );
        }
    }
}

pub(crate) struct Slot {
    pub(crate) state: StateCell,
    body: UnsafeCell<SlotBody>,
}

// The body is only accessed by the owner of the current state, see `StateCell`.
unsafe impl Sync for Slot {}

impl Slot {
    pub(crate) fn new() -> Self {
        Slot {
            state: StateCell::new(),
            body: UnsafeCell::new(SlotBody::empty()),
        }
    }

    /// # Safety
    ///
    /// The caller must own the slot's current state, and must not let the
    /// reference outlive that ownership.
    pub(crate) unsafe fn body(&self) -> &SlotBody {
        &*self.body.get()
    }

    /// # Safety
    ///
    /// Same as `body`, and the current state must be one in which the caller
    /// is allowed to write (leased `Free` for the submitter, `Claimed` for the
    /// worker).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn body_mut(&self) -> &mut SlotBody {
        &mut *self.body.get()
    }
}
