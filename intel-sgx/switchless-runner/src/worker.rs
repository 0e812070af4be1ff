/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::bail;
use log::{debug, error, info};

use switchless_abi::Direction;
use switchless_queue::{BackoffPolicy, IdleBackoff, TryClaimError};

use crate::marshal::OutputBuffer;
use crate::session::{CallContext, Shared};
use crate::stats::Stats;

/// One unit of work for a polling worker.
pub(crate) trait Poll: Send + 'static {
    /// Services at most one call, returning whether there was one.
    fn poll(&mut self) -> bool;
}

/// Claims calls from one direction's queue and runs them through that
/// direction's dispatcher.
pub(crate) struct DispatchWorker {
    shared: Arc<Shared>,
    direction: Direction,
    out: OutputBuffer,
}

impl DispatchWorker {
    pub(crate) fn new(shared: Arc<Shared>, direction: Direction) -> Self {
        DispatchWorker {
            shared,
            direction,
            out: OutputBuffer::new(),
        }
    }
}

impl Poll for DispatchWorker {
    fn poll(&mut self) -> bool {
        let shared = &*self.shared;
        let channel = shared.channel(self.direction);
        let queue = match channel.queue() {
            Some(queue) => queue,
            None => return false,
        };
        match queue.poll_claim() {
            Ok(claim) => {
                let ctx = CallContext::new(shared, self.direction);
                let status = channel.dispatcher.invoke(&ctx, claim.call_id(), claim.args(), &mut self.out);
                claim.complete(status, self.out.as_slice());
                true
            }
            Err(TryClaimError::Empty) => false,
        }
    }
}

thread_local! {
    static ON_WORKER: Cell<bool> = Cell::new(false);
}

/// Whether the current thread is a switchless worker.
pub(crate) fn on_worker_thread() -> bool {
    ON_WORKER.with(Cell::get)
}

/// Decrements the live worker gauge however the worker exits.
struct Alive(Arc<Stats>);

impl Alive {
    fn new(stats: Arc<Stats>) -> Self {
        stats.worker_started();
        Alive(stats)
    }
}

impl Drop for Alive {
    fn drop(&mut self) {
        self.0.worker_exited();
    }
}

/// A fixed set of polling threads.
///
/// Dropping the pool stops and joins its threads.
pub(crate) struct WorkerPool {
    name: String,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<u64>>,
}

impl WorkerPool {
    /// Spawns `n` workers named `switchless-<name>-<i>`, each running its
    /// own poller from `make`. If a spawn fails, the workers already running
    /// are stopped before the error is returned.
    pub(crate) fn start<P, F>(
        n: usize,
        name: &str,
        policy: BackoffPolicy,
        stats: &Arc<Stats>,
        make: F,
    ) -> io::Result<WorkerPool>
    where
        P: Poll,
        F: FnMut() -> P,
    {
        Self::start_with(n, name, policy, stats, make, |builder, f| builder.spawn(f))
    }

    fn start_with<P, F, S>(
        n: usize,
        name: &str,
        policy: BackoffPolicy,
        stats: &Arc<Stats>,
        mut make: F,
        mut spawn: S,
    ) -> io::Result<WorkerPool>
    where
        P: Poll,
        F: FnMut() -> P,
        S: FnMut(thread::Builder, Box<dyn FnOnce() -> u64 + Send>) -> io::Result<JoinHandle<u64>>,
    {
        let mut pool = WorkerPool {
            name: name.to_owned(),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::with_capacity(n),
        };
        for i in 0..n {
            let poller = make();
            let shutdown = pool.shutdown.clone();
            let alive = Alive::new(stats.clone());
            let builder = thread::Builder::new().name(format!("switchless-{}-{}", name, i));
            let handle = spawn(
                builder,
                Box::new(move || {
                    let _alive = alive;
                    ON_WORKER.with(|w| w.set(true));
                    run(poller, &shutdown, policy)
                }),
            )?;
            pool.workers.push(handle);
        }
        info!("Started {} switchless {} workers", n, name);
        Ok(pool)
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Stops every worker and waits for all of them to exit.
    pub(crate) fn shutdown(mut self) -> anyhow::Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        let mut panicked = 0;
        for (i, handle) in self.workers.drain(..).enumerate() {
            match handle.join() {
                Ok(spins) => debug!("Worker switchless-{}-{} exited, {} idle spins", self.name, i, spins),
                Err(_) => panicked += 1,
            }
        }
        if panicked > 0 {
            bail!("{} switchless {} worker(s) panicked", panicked, self.name);
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            if let Err(e) = self.stop() {
                error!("{:#}", e);
            }
        }
    }
}

fn run<P: Poll>(mut poller: P, shutdown: &AtomicBool, policy: BackoffPolicy) -> u64 {
    let mut backoff = IdleBackoff::new(policy);
    while !shutdown.load(Ordering::Acquire) {
        if poller.poll() {
            backoff.reset();
        } else {
            backoff.idle();
        }
    }
    backoff.total_spins()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counter {
        polls: Arc<AtomicUsize>,
        found: bool,
    }

    impl Poll for Counter {
        fn poll(&mut self) -> bool {
            self.polls.fetch_add(1, Ordering::Relaxed);
            self.found
        }
    }

    struct Panicker;

    impl Poll for Panicker {
        fn poll(&mut self) -> bool {
            panic!("worker failure");
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            spin_count: 16,
            yield_count: 4,
            idle_sleep: Duration::from_micros(10),
        }
    }

    #[test]
    fn start_and_shutdown() {
        let stats = Arc::new(Stats::default());
        let polls = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::start(3, "test", policy(), &stats, || Counter {
            polls: polls.clone(),
            found: false,
        })
        .unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(stats.snapshot().workers_alive, 3);
        while polls.load(Ordering::Relaxed) < 100 {
            thread::yield_now();
        }
        pool.shutdown().unwrap();
        assert_eq!(stats.snapshot().workers_alive, 0);

        // Nothing polls after shutdown returns.
        let after = polls.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(polls.load(Ordering::Relaxed), after);
    }

    #[test]
    fn busy_workers_stop() {
        let stats = Arc::new(Stats::default());
        let polls = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::start(2, "busy", policy(), &stats, || Counter {
            polls: polls.clone(),
            found: true,
        })
        .unwrap();
        drop(pool);
        assert_eq!(stats.snapshot().workers_alive, 0);
    }

    #[test]
    fn failed_spawn_stops_started_workers() {
        let stats = Arc::new(Stats::default());
        let polls = Arc::new(AtomicUsize::new(0));
        let mut attempts = 0;
        let result = WorkerPool::start_with(
            3,
            "spawn",
            policy(),
            &stats,
            || Counter {
                polls: polls.clone(),
                found: false,
            },
            |builder, f| {
                attempts += 1;
                if attempts == 2 {
                    return Err(io::Error::new(io::ErrorKind::Other, "out of threads"));
                }
                builder.spawn(f)
            },
        );
        match result {
            Err(e) => assert_eq!(e.to_string(), "out of threads"),
            Ok(_) => panic!("pool started without its second worker"),
        }
        assert_eq!(attempts, 2);
        // The first worker was joined and the unspawned one never counted.
        assert_eq!(stats.snapshot().workers_alive, 0);
        let after = polls.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(polls.load(Ordering::Relaxed), after);
    }

    #[test]
    fn worker_threads_are_marked() {
        assert!(!on_worker_thread());
        let stats = Arc::new(Stats::default());
        let seen = Arc::new(AtomicUsize::new(0));

        struct Marked(Arc<AtomicUsize>);

        impl Poll for Marked {
            fn poll(&mut self) -> bool {
                if on_worker_thread() {
                    self.0.fetch_add(1, Ordering::Relaxed);
                }
                false
            }
        }

        let pool = WorkerPool::start(1, "marked", policy(), &stats, || Marked(seen.clone())).unwrap();
        while seen.load(Ordering::Relaxed) == 0 {
            thread::yield_now();
        }
        pool.shutdown().unwrap();
    }

    #[test]
    fn panicking_worker_is_reported() {
        let stats = Arc::new(Stats::default());
        let pool = WorkerPool::start(1, "panic", policy(), &stats, || Panicker).unwrap();
        let err = pool.shutdown().unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert_eq!(stats.snapshot().workers_alive, 0);
    }
}
