/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! An in-process enclave for tests and demos.
//!
//! The simulated enclave runs calls on the calling thread, like a real
//! trapped call, after busy-waiting for a configurable time to stand in for
//! the cost of the mode transition.

use std::hint;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use log::debug;

use switchless_abi::Direction;

use crate::config::SwitchlessConfig;
use crate::loader::{CreateFlags, Enclave, Load, SwitchlessInfo};

#[derive(Default)]
struct Counters {
    fail_create: AtomicBool,
    fail_switchless_init: AtomicBool,
    live: AtomicUsize,
    transitions: AtomicU64,
}

#[derive(Clone)]
pub struct Simulator {
    transition_cost: Duration,
    counters: Arc<Counters>,
}

impl Simulator {
    pub const DEFAULT_TRANSITION_COST: Duration = Duration::from_micros(5);

    pub fn new() -> Self {
        Self::with_transition_cost(Self::DEFAULT_TRANSITION_COST)
    }

    pub fn with_transition_cost(transition_cost: Duration) -> Self {
        Simulator {
            transition_cost,
            counters: Arc::default(),
        }
    }

    /// Makes subsequent `create` calls fail.
    pub fn fail_create(&self, fail: bool) {
        self.counters.fail_create.store(fail, Ordering::Relaxed);
    }

    /// Makes enclaves created from now on reject switchless initialization.
    pub fn fail_switchless_init(&self, fail: bool) {
        self.counters.fail_switchless_init.store(fail, Ordering::Relaxed);
    }

    /// Enclaves created and not yet terminated or dropped.
    pub fn live_enclaves(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Total transitions performed by enclaves of this simulator.
    pub fn transitions(&self) -> u64 {
        self.counters.transitions.load(Ordering::Relaxed)
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Load for Simulator {
    fn create(&self, path: &Path, flags: CreateFlags, _config: &SwitchlessConfig) -> anyhow::Result<Box<dyn Enclave>> {
        if self.counters.fail_create.load(Ordering::Relaxed) {
            bail!("simulated failure creating {}", path.display());
        }
        debug!("Simulating enclave {} ({:?})", path.display(), flags);
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedEnclave {
            path: path.to_owned(),
            transition_cost: self.transition_cost,
            fail_switchless_init: self.counters.fail_switchless_init.load(Ordering::Relaxed),
            terminated: AtomicBool::new(false),
            counters: self.counters.clone(),
        }))
    }
}

struct SimulatedEnclave {
    path: PathBuf,
    transition_cost: Duration,
    fail_switchless_init: bool,
    terminated: AtomicBool,
    counters: Arc<Counters>,
}

fn busy_wait(cost: Duration) {
    if cost == Duration::from_secs(0) {
        return;
    }
    let start = Instant::now();
    while start.elapsed() < cost {
        hint::spin_loop();
    }
}

impl Enclave for SimulatedEnclave {
    fn transition(&self, direction: Direction, f: &mut dyn FnMut()) -> anyhow::Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            bail!("{} into terminated enclave {}", direction.as_str(), self.path.display());
        }
        self.counters.transitions.fetch_add(1, Ordering::Relaxed);
        busy_wait(self.transition_cost);
        f();
        Ok(())
    }

    fn init_switchless(&self, info: &SwitchlessInfo) -> anyhow::Result<()> {
        if self.fail_switchless_init {
            bail!("simulated switchless initialization failure");
        }
        debug!("Enclave {} switchless channels: {:?}", self.path.display(), info);
        Ok(())
    }

    fn terminate(&self) -> anyhow::Result<()> {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for SimulatedEnclave {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let sim = Simulator::with_transition_cost(Duration::from_secs(0));
        let config = SwitchlessConfig::default();
        let enclave = sim.create(Path::new("test.sgxs"), CreateFlags::SIMULATE, &config).unwrap();
        assert_eq!(sim.live_enclaves(), 1);

        let mut ran = false;
        enclave.transition(Direction::Ecall, &mut || ran = true).unwrap();
        assert!(ran);
        assert_eq!(sim.transitions(), 1);

        enclave.terminate().unwrap();
        assert_eq!(sim.live_enclaves(), 0);
        assert!(enclave.transition(Direction::Ecall, &mut || ()).is_err());
        drop(enclave);
        assert_eq!(sim.live_enclaves(), 0);
    }

    #[test]
    fn injected_failures() {
        let sim = Simulator::new();
        let config = SwitchlessConfig::default();
        sim.fail_create(true);
        assert!(sim.create(Path::new("a"), CreateFlags::empty(), &config).is_err());
        assert_eq!(sim.live_enclaves(), 0);

        sim.fail_create(false);
        sim.fail_switchless_init(true);
        let enclave = sim.create(Path::new("a"), CreateFlags::empty(), &config).unwrap();
        assert!(enclave.init_switchless(&SwitchlessInfo::new(&config)).is_err());
        drop(enclave);
        assert_eq!(sim.live_enclaves(), 0);
    }
}
