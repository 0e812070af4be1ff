/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::path::Path;

use bitflags::bitflags;

use switchless_abi::Direction;

use crate::config::SwitchlessConfig;

bitflags! {
    pub struct CreateFlags: u32 {
        const DEBUG    = 0b0000_0001;
        const SIMULATE = 0b0000_0010;
    }
}

/// Creates enclave instances.
pub trait Load {
    fn create(&self, path: &Path, flags: CreateFlags, config: &SwitchlessConfig) -> anyhow::Result<Box<dyn Enclave>>;
}

/// A loaded enclave instance.
pub trait Enclave: Send + Sync {
    /// Crosses the boundary in `direction` on the calling thread, runs `f` on
    /// the far side, and returns once back on the near side.
    fn transition(&self, direction: Direction, f: &mut dyn FnMut()) -> anyhow::Result<()>;

    /// Tells the enclave which switchless channels the session set up. Called
    /// once, after the worker pools are running and before any call is made.
    fn init_switchless(&self, info: &SwitchlessInfo) -> anyhow::Result<()>;

    /// Unloads the enclave. No transition happens afterwards.
    fn terminate(&self) -> anyhow::Result<()>;
}

/// The switchless channels of a session, as reported to the enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchlessInfo {
    /// Slots in the ECALL queue, if switchless ECALLs are enabled.
    pub ecall_slots: Option<usize>,
    /// Slots in the OCALL queue, if switchless OCALLs are enabled.
    pub ocall_slots: Option<usize>,
    pub enclave_workers: usize,
    pub host_workers: usize,
}

impl SwitchlessInfo {
    pub(crate) fn new(config: &SwitchlessConfig) -> Self {
        let slots = |direction| Some(config.queue_depth).filter(|_| config.enabled(direction));
        let workers = |direction| if config.enabled(direction) { config.worker_count(direction) } else { 0 };
        SwitchlessInfo {
            ecall_slots: slots(Direction::Ecall),
            ocall_slots: slots(Direction::Ocall),
            enclave_workers: workers(Direction::Ecall),
            host_workers: workers(Direction::Ocall),
        }
    }
}
