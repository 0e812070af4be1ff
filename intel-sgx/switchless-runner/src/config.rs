/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::time::Duration;

use log::warn;
use thiserror::Error as ThisError;

use switchless_abi::Direction;
use switchless_queue::BackoffPolicy;

/// Switchless settings of a session. Fixed once the session is built.
///
/// The defaults leave both directions trapped-only, so a session built from
/// `SwitchlessConfig::default()` spawns no worker threads.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct SwitchlessConfig {
    pub enable_switchless_ocalls: bool,
    pub enable_switchless_ecalls: bool,
    /// Workers polling the OCALL queue.
    pub host_worker_count: usize,
    /// Workers polling the ECALL queue.
    pub enclave_worker_count: usize,
    /// Number of slots in each enabled queue.
    pub queue_depth: usize,
    pub spin_count: u32,
    pub yield_count: u32,
    pub idle_sleep: Duration,
}

impl Default for SwitchlessConfig {
    fn default() -> Self {
        SwitchlessConfig {
            enable_switchless_ocalls: false,
            enable_switchless_ecalls: false,
            host_worker_count: 2,
            enclave_worker_count: 2,
            queue_depth: 64,
            spin_count: BackoffPolicy::DEFAULT_SPIN_COUNT,
            yield_count: BackoffPolicy::DEFAULT_YIELD_COUNT,
            idle_sleep: BackoffPolicy::DEFAULT_IDLE_SLEEP,
        }
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue depth must be non-zero")]
    ZeroQueueDepth,
    #[error("switchless {} calls are enabled but no workers are configured", .0.as_str())]
    NoWorkers(Direction),
    #[error("queue depth {depth} is smaller than the {} worker count {workers}", .direction.as_str())]
    QueueTooShallow {
        direction: Direction,
        depth: usize,
        workers: usize,
    },
}

impl SwitchlessConfig {
    pub fn enabled(&self, direction: Direction) -> bool {
        match direction {
            Direction::Ecall => self.enable_switchless_ecalls,
            Direction::Ocall => self.enable_switchless_ocalls,
        }
    }

    /// ECALLs are serviced by workers on the enclave side, OCALLs by workers
    /// on the host side.
    pub fn worker_count(&self, direction: Direction) -> usize {
        match direction {
            Direction::Ecall => self.enclave_worker_count,
            Direction::Ocall => self.host_worker_count,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            spin_count: self.spin_count,
            yield_count: self.yield_count,
            idle_sleep: self.idle_sleep,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut polling = 0;
        for &direction in &[Direction::Ecall, Direction::Ocall] {
            if !self.enabled(direction) {
                continue;
            }
            if self.queue_depth == 0 {
                return Err(ConfigError::ZeroQueueDepth);
            }
            let workers = self.worker_count(direction);
            if workers == 0 {
                return Err(ConfigError::NoWorkers(direction));
            }
            if self.queue_depth < workers {
                return Err(ConfigError::QueueTooShallow {
                    direction,
                    depth: self.queue_depth,
                    workers,
                });
            }
            polling += workers;
        }

        let cpus = num_cpus::get();
        if polling > cpus {
            warn!(
                "{} switchless workers will poll on {} CPUs, expect degraded latency",
                polling, cpus
            );
        }
        Ok(())
    }
}
