/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use fnv::FnvHashMap;
use log::debug;

use switchless_abi::{CallId, CallStatus, Direction, SLOT_BUFFER_SIZE};

use crate::error::RegisterError;
use crate::marshal::OutputBuffer;
use crate::session::CallContext;

/// Metadata of one edge function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallDescriptor {
    pub id: CallId,
    pub direction: Direction,
    /// Exact length of the marshaled arguments.
    pub arg_size: usize,
    pub switchless: bool,
}

impl CallDescriptor {
    pub fn new(id: CallId, direction: Direction, arg_size: usize) -> Self {
        CallDescriptor {
            id,
            direction,
            arg_size,
            switchless: false,
        }
    }

    pub fn switchless(mut self, switchless: bool) -> Self {
        self.switchless = switchless;
        self
    }
}

pub(crate) type Handler =
    Box<dyn Fn(&CallContext<'_>, &[u8], &mut OutputBuffer) -> anyhow::Result<()> + Send + Sync>;

struct Entry {
    descriptor: CallDescriptor,
    handler: Handler,
    invocations: AtomicU64,
}

/// The dispatch table of one direction. Populated before the session becomes
/// active and read-only afterwards.
pub(crate) struct Dispatcher {
    direction: Direction,
    entries: FnvHashMap<CallId, Entry>,
}

impl Dispatcher {
    pub(crate) fn new(direction: Direction) -> Self {
        Dispatcher {
            direction,
            entries: FnvHashMap::default(),
        }
    }

    pub(crate) fn register(&mut self, descriptor: CallDescriptor, handler: Handler) -> Result<(), RegisterError> {
        debug_assert_eq!(descriptor.direction, self.direction);
        if descriptor.arg_size > SLOT_BUFFER_SIZE {
            return Err(RegisterError::ArgumentBufferTooLarge {
                call_id: descriptor.id,
                size: descriptor.arg_size,
            });
        }
        if self.entries.contains_key(&descriptor.id) {
            return Err(RegisterError::DuplicateCallId {
                direction: self.direction,
                call_id: descriptor.id,
            });
        }
        self.entries.insert(descriptor.id, Entry {
            descriptor,
            handler,
            invocations: AtomicU64::new(0),
        });
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// How many times the handler of `call_id` has been run.
    pub(crate) fn invocations(&self, call_id: CallId) -> Option<u64> {
        self.entries.get(&call_id).map(|e| e.invocations.load(Ordering::Relaxed))
    }

    /// Runs the handler of `call_id` and leaves its output in `out`.
    ///
    /// Never unwinds. Every failure is turned into a status, with a message
    /// or the expected argument size written to `out`.
    pub(crate) fn invoke(&self, ctx: &CallContext<'_>, call_id: CallId, args: &[u8], out: &mut OutputBuffer) -> CallStatus {
        out.clear();
        let entry = match self.entries.get(&call_id) {
            Some(entry) => entry,
            None => {
                debug!("{} call id {} is not registered", self.direction.as_str(), call_id);
                return CallStatus::UnknownCallId;
            }
        };
        if args.len() != entry.descriptor.arg_size {
            let _ = out.write(&(entry.descriptor.arg_size as u32).to_le_bytes());
            return CallStatus::ArgumentSizeMismatch;
        }

        entry.invocations.fetch_add(1, Ordering::Relaxed);
        let result = {
            let _scope = ctx.enter_handler();
            panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(ctx, args, out)))
        };
        if out.overflowed() {
            out.clear();
            return CallStatus::ResultOverflow;
        }
        match result {
            Ok(Ok(())) => CallStatus::Success,
            Ok(Err(e)) => {
                write_message(out, &format!("{:#}", e));
                CallStatus::HandlerFailed
            }
            Err(payload) => {
                write_message(out, panic_message(&*payload));
                CallStatus::HandlerPanicked
            }
        }
    }
}

fn write_message(out: &mut OutputBuffer, message: &str) {
    out.clear();
    let len = message.len().min(SLOT_BUFFER_SIZE);
    let _ = out.write(&message.as_bytes()[..len]);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "Box<dyn Any>"
    }
}
