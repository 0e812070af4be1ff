/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Host-side runtime for switchless edge calls.
//!
//! A [`Session`] ties together one enclave instance, a [`SwitchlessQueue`]
//! and a worker pool per call direction, and a dispatch table per direction.
//! Calls are issued with [`Session::call`] (or [`CallContext::call`] from
//! inside a handler) and take the switchless path when it is enabled for the
//! direction and the function, falling back to a trapped call through the
//! enclave when the queue is full.
//!
//! Enclave loading is not implemented here. It is consumed through the
//! [`Load`] and [`Enclave`] traits; the [`sim`] module provides an
//! in-process implementation.
//!
//! [`SwitchlessQueue`]: ../switchless_queue/struct.SwitchlessQueue.html
#![doc(
    html_logo_url = "https://edp.fortanix.com/img/docs/edp-logo.svg",
    html_favicon_url = "https://edp.fortanix.com/favicon.ico",
    html_root_url = "https://edp.fortanix.com/docs/api/"
)]

mod config;
pub mod crl;
mod dispatcher;
mod error;
mod loader;
pub mod marshal;
mod session;
pub mod sim;
mod stats;
mod trapped;
mod worker;

pub use switchless_abi::{CallId, CallStatus, Direction, SLOT_BUFFER_SIZE};

pub use crate::config::{ConfigError, SwitchlessConfig};
pub use crate::dispatcher::CallDescriptor;
pub use crate::error::{CallError, InitializationError, RegisterError};
pub use crate::loader::{CreateFlags, Enclave, Load, SwitchlessInfo};
pub use crate::marshal::{EdgeCall, MarshalError, OutputBuffer};
pub use crate::session::{CallContext, Session, SessionBuilder, SessionState};
pub use crate::stats::{global_stats, Stats, StatsSnapshot};
