/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::fmt::{Error as FmtError, Write};
use std::result::Result as StdResult;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;

lazy_static! {
    static ref GLOBAL_STATS: Stats = Stats::default();
}

/// How a call was serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallPath {
    Switchless,
    Trapped,
    /// Trapped because the queue was full.
    Fallback,
}

/// Diagnostic counters of a session. Not needed for correctness.
#[derive(Default, Debug)]
pub struct Stats {
    total_calls: AtomicU64,
    switchless_calls: AtomicU64,
    trapped_calls: AtomicU64,
    fallbacks: AtomicU64,
    rejected_calls: AtomicU64,
    latency_ns_total: AtomicU64,
    latency_ns_max: AtomicU64,
    workers_alive: AtomicUsize,
}

impl Stats {
    pub(crate) fn record_call(&self, path: CallPath, latency: Duration) {
        for stats in [self, &*GLOBAL_STATS].iter() {
            stats.record_call_local(path, latency);
        }
    }

    fn record_call_local(&self, path: CallPath, latency: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        match path {
            CallPath::Switchless => self.switchless_calls.fetch_add(1, Ordering::Relaxed),
            CallPath::Trapped => self.trapped_calls.fetch_add(1, Ordering::Relaxed),
            CallPath::Fallback => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                self.trapped_calls.fetch_add(1, Ordering::Relaxed)
            }
        };
        let ns = latency.as_nanos().min(u64::MAX as u128) as u64;
        self.latency_ns_total.fetch_add(ns, Ordering::Relaxed);
        self.latency_ns_max.fetch_max(ns, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        GLOBAL_STATS.rejected_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_started(&self) {
        self.workers_alive.fetch_add(1, Ordering::SeqCst);
        GLOBAL_STATS.workers_alive.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn worker_exited(&self) {
        self.workers_alive.fetch_sub(1, Ordering::SeqCst);
        GLOBAL_STATS.workers_alive.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            switchless_calls: self.switchless_calls.load(Ordering::Relaxed),
            trapped_calls: self.trapped_calls.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            latency_total: Duration::from_nanos(self.latency_ns_total.load(Ordering::Relaxed)),
            latency_max: Duration::from_nanos(self.latency_ns_max.load(Ordering::Relaxed)),
            workers_alive: self.workers_alive.load(Ordering::SeqCst),
        }
    }
}

/// Counters aggregated over every session in the process.
pub fn global_stats() -> StatsSnapshot {
    GLOBAL_STATS.snapshot()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Calls that were accepted, on either path. Excludes rejected calls.
    pub total_calls: u64,
    pub switchless_calls: u64,
    /// Includes fallbacks.
    pub trapped_calls: u64,
    /// Switchless calls that found the queue full and were trapped instead.
    pub fallbacks: u64,
    /// Calls refused because the session was terminating.
    pub rejected_calls: u64,
    pub latency_total: Duration,
    pub latency_max: Duration,
    pub workers_alive: usize,
}

impl StatsSnapshot {
    pub fn mean_latency(&self) -> Option<Duration> {
        match self.total_calls {
            0 => None,
            n => Some(Duration::from_nanos((self.latency_total.as_nanos() / n as u128) as u64)),
        }
    }

    // A "stock" formatting for this information
    pub fn pretty_format(&self) -> StdResult<String, FmtError> {
        let mut out = String::new();
        writeln!(out, "Calls: {} total, {} switchless, {} trapped ({} after a full queue), {} rejected",
            self.total_calls, self.switchless_calls, self.trapped_calls, self.fallbacks, self.rejected_calls)?;
        match self.mean_latency() {
            Some(mean) => writeln!(out, "Latency: mean {:?}, max {:?}", mean, self.latency_max)?,
            None => writeln!(out, "Latency: n/a")?,
        }
        writeln!(out, "Live workers: {}", self.workers_alive)?;
        Ok(out)
    }
}
