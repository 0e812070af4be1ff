/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::{Backoff, CachePadded};

use super::*;
use crate::slot::Slot;

pub(crate) struct QueueBuffer {
    slots: Box<[Slot]>,
    submit_cursor: CachePadded<AtomicUsize>,
    claim_cursor: CachePadded<AtomicUsize>,
    // Upper bound on the number of `Submitted` slots. Lets idle workers skip
    // the scan.
    pending: CachePadded<AtomicUsize>,
    next_token: AtomicU64,
}

impl QueueBuffer {
    fn new(len: usize) -> Self {
        assert!(len > 0, "queue length should be non-zero");
        let slots = (0..len).map(|_| Slot::new()).collect::<Vec<_>>();
        QueueBuffer {
            slots: slots.into_boxed_slice(),
            submit_cursor: CachePadded::new(AtomicUsize::new(0)),
            claim_cursor: CachePadded::new(AtomicUsize::new(0)),
            pending: CachePadded::new(AtomicUsize::new(0)),
            next_token: AtomicU64::new(1),
        }
    }
}

impl SwitchlessQueue<()> {
    pub fn new(len: usize) -> Self {
        Self::with_observer(len, ())
    }
}

impl<O: TransitionObserver> Clone for SwitchlessQueue<O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            observer: self.observer.clone(),
        }
    }
}

impl<O: TransitionObserver> SwitchlessQueue<O> {
    pub fn with_observer(len: usize, observer: O) -> Self {
        SwitchlessQueue {
            inner: Arc::new(QueueBuffer::new(len)),
            observer,
        }
    }

    /// The number of slots, fixed at creation.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.inner.slots[slot].state.load()
    }

    /// The number of slots that are `Submitted` or `Claimed`.
    pub fn in_flight(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| matches!(slot.state.load(), SlotState::Submitted | SlotState::Claimed))
            .count()
    }

    /// Whether both values refer to the same slots.
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn next_token(&self) -> u64 {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        match token {
            0 => self.next_token(),
            _ => token,
        }
    }

    /// Copies `args` into a `Free` slot and submits it.
    ///
    /// Scans every slot at most once, starting from a rotating cursor, and
    /// never blocks. `Err(QueueFull)` means the caller must service the call
    /// some other way.
    pub fn try_submit(&self, call_id: CallId, args: &[u8]) -> Result<SlotHandle<'_, O>, TrySubmitError> {
        if args.len() > SLOT_BUFFER_SIZE {
            return Err(TrySubmitError::BufferOverflow);
        }

        let len = self.capacity();
        let start = self.inner.submit_cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..len {
            let index = start.wrapping_add(i) % len;
            let slot = &self.inner.slots[index];
            if !slot.state.try_lease() {
                continue;
            }

            let token = self.next_token();
            // Safety: the lease gives us exclusive access to the body.
            let body = unsafe { slot.body_mut() };
            body.call_id = call_id;
            body.token = token;
            body.arg_len = args.len() as u32;
            body.args[..args.len()].copy_from_slice(args);
            body.status = 0;
            body.ret_len = 0;

            // Counted before publishing so a worker can never see more
            // submitted slots than `pending` accounts for.
            self.inner.pending.fetch_add(1, Ordering::AcqRel);
            self.observer.transition(index, token, SlotState::Free, SlotState::Submitted);
            slot.state.publish_submitted();

            return Ok(SlotHandle {
                queue: self,
                index,
                token,
                released: false,
            });
        }
        Err(TrySubmitError::QueueFull)
    }

    /// Claims one `Submitted` slot. Exactly one caller wins any given slot.
    pub fn poll_claim(&self) -> Result<Claim<'_, O>, TryClaimError> {
        if self.inner.pending.load(Ordering::Acquire) == 0 {
            return Err(TryClaimError::Empty);
        }

        let len = self.capacity();
        let start = self.inner.claim_cursor.load(Ordering::Relaxed);
        for i in 0..len {
            let index = start.wrapping_add(i) % len;
            let slot = &self.inner.slots[index];
            if !slot.state.try_claim() {
                continue;
            }

            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            self.inner.claim_cursor.store((index + 1) % len, Ordering::Relaxed);
            // Safety: we hold the claim.
            let token = unsafe { slot.body().token };
            self.observer.transition(index, token, SlotState::Submitted, SlotState::Claimed);

            return Ok(Claim {
                queue: self,
                index,
                token,
                completed: false,
            });
        }
        Err(TryClaimError::Empty)
    }

    /// Writes the result of a claimed call and marks it `Done`.
    ///
    /// A `result` larger than a slot's result buffer is replaced by an empty
    /// result with status [`CallStatus::ResultOverflow`].
    ///
    /// # Panics
    ///
    /// Panics if `claim` was obtained from a different queue.
    pub fn complete(&self, mut claim: Claim<'_, O>, status: CallStatus, result: &[u8]) {
        assert!(
            self.same_queue(claim.queue),
            "claim does not belong to this queue"
        );
        self.finish(claim.index, claim.token, status, result);
        claim.completed = true;
    }

    /// Returns a `Done` slot to `Free`. If the call is not done yet, the
    /// handle is given back.
    ///
    /// # Panics
    ///
    /// Panics if `handle` was obtained from a different queue.
    pub fn try_release<'q>(&self, mut handle: SlotHandle<'q, O>) -> Result<(), SlotHandle<'q, O>> {
        assert!(
            self.same_queue(handle.queue),
            "slot handle does not belong to this queue"
        );
        if self.release(handle.index, handle.token) {
            handle.released = true;
            Ok(())
        } else {
            Err(handle)
        }
    }

    fn finish(&self, index: usize, token: u64, mut status: CallStatus, result: &[u8]) {
        let slot = &self.inner.slots[index];
        // Safety: the caller holds the claim on this slot.
        let body = unsafe { slot.body_mut() };
        if result.len() > SLOT_BUFFER_SIZE {
            status = CallStatus::ResultOverflow;
            body.ret_len = 0;
        } else {
            body.ret[..result.len()].copy_from_slice(result);
            body.ret_len = result.len() as u32;
        }
        body.status = status.as_raw();
        self.observer.transition(index, token, SlotState::Claimed, SlotState::Done);
        slot.state.publish_done();
    }

    fn release(&self, index: usize, token: u64) -> bool {
        let slot = &self.inner.slots[index];
        if slot.state.load() != SlotState::Done {
            return false;
        }
        self.observer.transition(index, token, SlotState::Done, SlotState::Free);
        let freed = slot.state.try_free();
        debug_assert!(freed, "only the submitter may free a done slot");
        freed
    }
}

/// The result of a call, borrowed from its slot.
#[derive(Debug, Clone, Copy)]
pub struct Response<'a> {
    status: u32,
    token: u64,
    data: &'a [u8],
}

impl<'a> Response<'a> {
    /// `None` if the other side wrote a status word this side doesn't know.
    pub fn status(&self) -> Option<CallStatus> {
        CallStatus::from_raw(self.status)
    }

    pub fn raw_status(&self) -> u32 {
        self.status
    }

    /// The token found in the slot. Differs from the handle's token only if
    /// the slot was overwritten by someone who didn't own it.
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

impl<'q, O: TransitionObserver> SlotHandle<'q, O> {
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn slot(&self) -> usize {
        self.index
    }

    pub fn is_done(&self) -> bool {
        self.queue.state(self.index) == SlotState::Done
    }

    pub fn response(&self) -> Option<Response<'_>> {
        if self.is_done() {
            Some(self.response_unchecked())
        } else {
            None
        }
    }

    fn response_unchecked(&self) -> Response<'_> {
        // Safety: the slot is `Done` and only we may move it out of `Done`.
        let body = unsafe { self.queue.inner.slots[self.index].body() };
        Response {
            status: body.status,
            token: body.token,
            data: body.ret(),
        }
    }

    /// Busy-waits until the call is done, backing off exponentially and then
    /// yielding the time slice between polls.
    pub fn wait(&self) {
        let backoff = Backoff::new();
        while !self.is_done() {
            backoff.snooze();
        }
    }

    /// Waits until the call is done, hands the response to `f` and releases
    /// the slot.
    pub fn wait_with<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(Response<'_>) -> R,
    {
        self.wait();
        let ret = f(self.response_unchecked());
        let released = self.queue.release(self.index, self.token);
        debug_assert!(released);
        self.released = true;
        ret
    }
}

impl<'q, O: TransitionObserver> Drop for SlotHandle<'q, O> {
    fn drop(&mut self) {
        if !self.released {
            self.wait();
            self.queue.release(self.index, self.token);
        }
    }
}

impl<'q, O: TransitionObserver> Claim<'q, O> {
    pub fn call_id(&self) -> CallId {
        // Safety: we hold the claim.
        unsafe { self.queue.inner.slots[self.index].body().call_id }
    }

    pub fn args(&self) -> &[u8] {
        // Safety: we hold the claim.
        unsafe { self.queue.inner.slots[self.index].body().args() }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn slot(&self) -> usize {
        self.index
    }

    pub fn complete(self, status: CallStatus, result: &[u8]) {
        let queue = self.queue;
        queue.complete(self, status, result)
    }
}

impl<'q, O: TransitionObserver> Drop for Claim<'q, O> {
    fn drop(&mut self) {
        if !self.completed {
            self.queue.finish(self.index, self.token, CallStatus::HandlerPanicked, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{echo_worker, RecordingObserver};
    use rand::Rng;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn basic() {
        let q = SwitchlessQueue::new(4);
        assert_eq!(q.poll_claim().err(), Some(TryClaimError::Empty));

        let h = q.try_submit(7, b"hello").unwrap();
        assert_eq!(q.state(h.slot()), SlotState::Submitted);
        let claim = q.poll_claim().unwrap();
        assert_eq!(claim.call_id(), 7);
        assert_eq!(claim.args(), b"hello");
        assert_eq!(claim.token(), h.token());
        assert_eq!(q.state(h.slot()), SlotState::Claimed);
        assert!(q.poll_claim().is_err());

        assert!(!h.is_done());
        assert!(h.response().is_none());
        let h = q.try_release(h).err().unwrap();

        q.complete(claim, CallStatus::Success, b"world");
        assert_eq!(q.in_flight(), 0);
        {
            let resp = h.response().unwrap();
            assert_eq!(resp.status(), Some(CallStatus::Success));
            assert_eq!(resp.data(), b"world");
            assert_eq!(resp.token(), h.token());
        }
        let slot = h.slot();
        assert!(q.try_release(h).is_ok());
        assert_eq!(q.state(slot), SlotState::Free);
    }

    #[test]
    fn full_after_one_scan() {
        const N: usize = 8;
        let q = SwitchlessQueue::new(N);
        let mut handles = Vec::new();
        for i in 0..N {
            handles.push(q.try_submit(i as _, &[i as u8]).unwrap());
        }
        assert_eq!(q.in_flight(), N);
        assert_eq!(q.try_submit(99, b"").err(), Some(TrySubmitError::QueueFull));

        // A done slot is not free until its submitter releases it.
        let claim = q.poll_claim().unwrap();
        let done = claim.slot();
        claim.complete(CallStatus::Success, &[]);
        assert_eq!(q.try_submit(99, b"").err(), Some(TrySubmitError::QueueFull));

        let pos = handles.iter().position(|h| h.response().is_some()).unwrap();
        assert_eq!(handles[pos].slot(), done);
        assert!(q.try_release(handles.remove(pos)).is_ok());

        let h = q.try_submit(99, b"").unwrap();
        assert_eq!(h.slot(), done);
        while let Ok(claim) = q.poll_claim() {
            claim.complete(CallStatus::Success, &[]);
        }
        h.wait_with(|resp| assert_eq!(resp.status(), Some(CallStatus::Success)));
        for h in handles {
            assert!(q.try_release(h).is_ok());
        }
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    fn oversized_arguments() {
        let q = SwitchlessQueue::new(2);
        let args = vec![0u8; SLOT_BUFFER_SIZE + 1];
        assert_eq!(q.try_submit(1, &args).err(), Some(TrySubmitError::BufferOverflow));
        let args = vec![0u8; SLOT_BUFFER_SIZE];
        let h = q.try_submit(1, &args).unwrap();
        let claim = q.poll_claim().unwrap();
        assert_eq!(claim.args().len(), SLOT_BUFFER_SIZE);
        let result = vec![1u8; SLOT_BUFFER_SIZE + 1];
        claim.complete(CallStatus::Success, &result);
        h.wait_with(|resp| {
            assert_eq!(resp.status(), Some(CallStatus::ResultOverflow));
            assert!(resp.data().is_empty());
        });
    }

    #[test]
    fn dropped_claim_reports_panic() {
        let q = SwitchlessQueue::new(2);
        let h = q.try_submit(3, b"x").unwrap();
        drop(q.poll_claim().unwrap());
        h.wait_with(|resp| assert_eq!(resp.status(), Some(CallStatus::HandlerPanicked)));
    }

    #[test]
    fn dropped_handle_waits_and_releases() {
        let q = SwitchlessQueue::new(1);
        let worker = {
            let q = q.clone();
            thread::spawn(move || loop {
                if let Ok(claim) = q.poll_claim() {
                    thread::sleep(std::time::Duration::from_millis(10));
                    claim.complete(CallStatus::Success, b"late");
                    break;
                }
            })
        };
        let h = q.try_submit(1, b"").unwrap();
        drop(h);
        assert_eq!(q.state(0), SlotState::Free);
        worker.join().unwrap();
        assert!(q.try_submit(2, b"").is_ok());
    }

    #[test]
    fn state_sequence_under_contention() {
        const SUBMITTERS: usize = 4;
        const WORKERS: usize = 3;
        const CALLS: usize = 500;

        let observer = RecordingObserver::default();
        let q = SwitchlessQueue::with_observer(SUBMITTERS - 1, observer.clone());
        let stop = Arc::new(AtomicBool::new(false));

        let workers = (0..WORKERS)
            .map(|_| {
                let q = q.clone();
                let stop = stop.clone();
                thread::spawn(move || echo_worker(&q, &stop))
            })
            .collect::<Vec<_>>();

        let submitters = (0..SUBMITTERS)
            .map(|t| {
                let q = q.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let (mut completed, mut full) = (0, 0);
                    for i in 0..CALLS {
                        let len = rng.gen_range(0..=64);
                        let payload = vec![(t * CALLS + i) as u8; len];
                        match q.try_submit(t as _, &payload) {
                            Ok(h) => {
                                h.wait_with(|resp| {
                                    assert_eq!(resp.status(), Some(CallStatus::Success));
                                    assert_eq!(resp.data(), &payload[..]);
                                });
                                completed += 1;
                            }
                            Err(TrySubmitError::QueueFull) => full += 1,
                            Err(e) => panic!("unexpected {:?}", e),
                        }
                    }
                    (completed, full)
                })
            })
            .collect::<Vec<_>>();

        let (mut completed, mut full) = (0, 0);
        for h in submitters {
            let (c, f) = h.join().unwrap();
            completed += c;
            full += f;
        }
        stop.store(true, Ordering::Release);
        let claimed: usize = workers.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(completed + full, SUBMITTERS * CALLS);
        assert_eq!(claimed, completed);
        assert_eq!(q.in_flight(), 0);

        let sequences = observer.sequences();
        assert_eq!(sequences.len(), completed);
        for (token, seq) in sequences {
            assert_eq!(
                seq,
                [
                    (SlotState::Free, SlotState::Submitted),
                    (SlotState::Submitted, SlotState::Claimed),
                    (SlotState::Claimed, SlotState::Done),
                    (SlotState::Done, SlotState::Free),
                ],
                "token {}",
                token
            );
        }
    }
}
