/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::hint;
use std::thread;
use std::time::Duration;

/// How a polling worker waits when there is nothing to claim.
///
/// An idle worker first spins for `spin_count` polls, then yields its time
/// slice for `yield_count` polls, then sleeps for `idle_sleep` between polls
/// until work shows up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub spin_count: u32,
    pub yield_count: u32,
    pub idle_sleep: Duration,
}

impl BackoffPolicy {
    pub const DEFAULT_SPIN_COUNT: u32 = 4096;
    pub const DEFAULT_YIELD_COUNT: u32 = 64;
    pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_micros(100);
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            spin_count: Self::DEFAULT_SPIN_COUNT,
            yield_count: Self::DEFAULT_YIELD_COUNT,
            idle_sleep: Self::DEFAULT_IDLE_SLEEP,
        }
    }
}

pub struct IdleBackoff {
    policy: BackoffPolicy,
    step: u32,
    total_spins: u64,
}

impl IdleBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        IdleBackoff {
            policy,
            step: 0,
            total_spins: 0,
        }
    }

    /// Call after a poll found work.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Call after a poll found nothing.
    pub fn idle(&mut self) {
        let spin_count = self.policy.spin_count;
        let yield_count = self.policy.yield_count;
        if self.step < spin_count {
            hint::spin_loop();
            self.total_spins += 1;
        } else if self.step - spin_count < yield_count {
            thread::yield_now();
        } else {
            thread::sleep(self.policy.idle_sleep);
        }
        self.step = self.step.saturating_add(1);
    }

    /// Whether the next `idle` call will sleep.
    pub fn is_sleeping(&self) -> bool {
        self.step >= self.policy.spin_count.saturating_add(self.policy.yield_count)
    }

    /// Number of busy-wait iterations since this backoff was created.
    pub fn total_spins(&self) -> u64 {
        self.total_spins
    }
}
