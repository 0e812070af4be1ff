/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use static_assertions::{assert_impl_all, assert_not_impl_any};

use crate::{CallStatus, Claim, SlotHandle, SlotState, SwitchlessQueue, TransitionObserver};

assert_impl_all!(SwitchlessQueue: Send, Sync, Clone);
assert_impl_all!(SlotHandle<'static>: Send);
assert_impl_all!(Claim<'static>: Send);
assert_not_impl_any!(SlotHandle<'static>: Clone);
assert_not_impl_any!(Claim<'static>: Clone);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub slot: usize,
    pub token: u64,
    pub from: SlotState,
    pub to: SlotState,
}

/// Records every transition it sees.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<Transition>>>,
}

impl TransitionObserver for RecordingObserver {
    fn transition(&self, slot: usize, token: u64, from: SlotState, to: SlotState) {
        self.events.lock().unwrap().push(Transition { slot, token, from, to });
    }
}

impl RecordingObserver {
    /// The recorded `(from, to)` pairs, grouped by call token.
    pub fn sequences(&self) -> HashMap<u64, Vec<(SlotState, SlotState)>> {
        let mut map = HashMap::<_, Vec<_>>::new();
        for t in self.events.lock().unwrap().iter() {
            map.entry(t.token).or_default().push((t.from, t.to));
        }
        map
    }
}

/// Echoes arguments back as results until `stop` is set and the queue is
/// drained. Returns the number of calls served.
pub fn echo_worker<O: TransitionObserver>(q: &SwitchlessQueue<O>, stop: &AtomicBool) -> usize {
    let mut served = 0;
    loop {
        match q.poll_claim() {
            Ok(claim) => {
                let args = claim.args().to_vec();
                claim.complete(CallStatus::Success, &args);
                served += 1;
            }
            Err(_) if stop.load(Ordering::Acquire) => return served,
            Err(_) => hint::spin_loop(),
        }
    }
}
