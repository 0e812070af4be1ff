/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use anyhow::format_err;

use switchless_abi::{CallId, Direction};

use crate::error::CallError;
use crate::marshal::OutputBuffer;
use crate::session::{CallContext, Shared};

/// Runs a call on the calling thread, on the far side of a mode transition.
///
/// Produces the same outcome as servicing the call through the queue.
pub(crate) fn call<R, F>(
    shared: &Shared,
    direction: Direction,
    call_id: CallId,
    args: &[u8],
    decode: F,
) -> Result<R, CallError>
where
    F: FnOnce(&[u8]) -> Result<R, CallError>,
{
    let dispatcher = &shared.channel(direction).dispatcher;
    let mut out = OutputBuffer::new();
    let mut status = None;
    shared
        .enclave()
        .transition(direction, &mut || {
            let ctx = CallContext::new(shared, direction);
            status = Some(dispatcher.invoke(&ctx, call_id, args, &mut out));
        })
        .map_err(CallError::Transition)?;

    let status = status.ok_or_else(|| {
        CallError::Transition(format_err!(
            "{} {} returned without running the call",
            direction.as_str(),
            call_id
        ))
    })?;
    CallError::from_response(direction, call_id, status.as_raw(), args.len(), out.as_slice())?;
    decode(out.as_slice())
}
