/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, format_err, Context};
use crossbeam::utils::Backoff;
use log::{error, info, warn};

use switchless_abi::{CallId, Direction, SLOT_BUFFER_SIZE};
use switchless_queue::{SwitchlessQueue, TrySubmitError};

use crate::config::SwitchlessConfig;
use crate::dispatcher::{CallDescriptor, Dispatcher, Handler};
use crate::error::{CallError, InitializationError};
use crate::loader::{CreateFlags, Enclave, Load, SwitchlessInfo};
use crate::marshal::{EdgeCall, MarshalError, OutputBuffer};
use crate::stats::{CallPath, Stats, StatsSnapshot};
use crate::trapped;
use crate::worker::{self, DispatchWorker, WorkerPool};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized = 0,
    Active = 1,
    /// No new calls are accepted, calls in progress run to completion.
    Draining = 2,
    Terminated = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> SessionState {
        match v {
            0 => SessionState::Uninitialized,
            1 => SessionState::Active,
            2 => SessionState::Draining,
            _ => SessionState::Terminated,
        }
    }
}

/// The queue and dispatch table of one direction.
pub(crate) struct Channel {
    queue: Option<SwitchlessQueue>,
    pub(crate) dispatcher: Dispatcher,
}

impl Channel {
    pub(crate) fn queue(&self) -> Option<&SwitchlessQueue> {
        self.queue.as_ref()
    }
}

/// Everything the workers of a session need. Workers hold it through an
/// `Arc`, but the session joins every worker before dropping its own
/// reference, so the queues are never freed while a worker can reach them.
pub(crate) struct Shared {
    state: AtomicU8,
    // Calls past the admission check. Paired with `state`: both are accessed
    // with SeqCst so that a call either sees `Draining` or is seen by the
    // drain loop.
    active_calls: AtomicUsize,
    ecalls: Channel,
    ocalls: Channel,
    enclave: Box<dyn Enclave>,
    config: SwitchlessConfig,
    stats: Arc<Stats>,
    fallback_warned: AtomicBool,
}

thread_local! {
    // Sessions with a handler running on this thread, innermost last.
    static RUNNING_HANDLERS: RefCell<Vec<*const Shared>> = RefCell::new(Vec::new());
}

/// Marks a handler of one session as running on the current thread.
pub(crate) struct HandlerScope(());

impl Drop for HandlerScope {
    fn drop(&mut self) {
        RUNNING_HANDLERS.with(|h| h.borrow_mut().pop());
    }
}

struct Admitted<'a>(&'a Shared);

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        self.0.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn channel(&self, direction: Direction) -> &Channel {
        match direction {
            Direction::Ecall => &self.ecalls,
            Direction::Ocall => &self.ocalls,
        }
    }

    pub(crate) fn enclave(&self) -> &dyn Enclave {
        &*self.enclave
    }

    fn handler_running(&self) -> bool {
        RUNNING_HANDLERS.with(|h| h.borrow().iter().any(|&s| ptr::eq(s, self)))
    }

    fn in_flight(&self) -> usize {
        [&self.ecalls, &self.ocalls]
            .iter()
            .filter_map(|c| c.queue())
            .map(|q| q.in_flight())
            .sum()
    }

    /// Nested calls are part of a call that was already admitted, and are
    /// accepted while draining.
    fn admit(&self, nested: bool) -> Result<Admitted<'_>, CallError> {
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        let admitted = Admitted(self);
        if !nested && self.state() != SessionState::Active {
            drop(admitted);
            self.stats.record_rejected();
            return Err(CallError::SessionTerminating);
        }
        Ok(admitted)
    }

    fn call<C: EdgeCall>(&self, args: &C::Args, nested: bool) -> Result<C::Output, CallError> {
        let mut buf = [0u8; SLOT_BUFFER_SIZE];
        let arg_buf = buf.get_mut(..C::ARG_SIZE).ok_or(MarshalError::Overflow {
            len: C::ARG_SIZE,
            capacity: SLOT_BUFFER_SIZE,
        })?;
        C::serialize_args(args, arg_buf)?;
        self.call_raw(C::DIRECTION, C::ID, C::SWITCHLESS, arg_buf, nested, |data| {
            Ok(C::deserialize_output(data)?)
        })
    }

    fn call_raw<R, F>(
        &self,
        direction: Direction,
        call_id: CallId,
        switchless: bool,
        args: &[u8],
        nested: bool,
        decode: F,
    ) -> Result<R, CallError>
    where
        F: FnOnce(&[u8]) -> Result<R, CallError>,
    {
        let _admitted = self.admit(nested)?;
        let start = Instant::now();
        // A worker waiting on a queue may be waiting on its own pool, so calls
        // made from worker threads are always trapped.
        let queue = self
            .channel(direction)
            .queue()
            .filter(|_| switchless && !worker::on_worker_thread());
        let (path, result) = match queue.map(|q| q.try_submit(call_id, args)) {
            Some(Ok(handle)) => {
                let token = handle.token();
                let result = handle.wait_with(|resp| {
                    if resp.token() != token {
                        return Err(CallError::Corrupted { call_id, status: resp.raw_status() });
                    }
                    CallError::from_response(direction, call_id, resp.raw_status(), args.len(), resp.data())?;
                    decode(resp.data())
                });
                (CallPath::Switchless, result)
            }
            Some(Err(TrySubmitError::QueueFull)) => {
                if !self.fallback_warned.swap(true, Ordering::Relaxed) {
                    warn!("Switchless {} queue is full, falling back to trapped calls", direction.as_str());
                }
                (CallPath::Fallback, trapped::call(self, direction, call_id, args, decode))
            }
            Some(Err(TrySubmitError::BufferOverflow)) | None => {
                (CallPath::Trapped, trapped::call(self, direction, call_id, args, decode))
            }
        };
        self.stats.record_call(path, start.elapsed());
        result
    }
}

/// Passed to every handler. Lets a handler issue calls of its own, in either
/// direction, while it runs.
pub struct CallContext<'a> {
    shared: &'a Shared,
    direction: Direction,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(shared: &'a Shared, direction: Direction) -> Self {
        CallContext { shared, direction }
    }

    /// The direction of the call being handled.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Like [`Session::call`], except that calls made on a switchless worker
    /// thread are always trapped.
    pub fn call<C: EdgeCall>(&self, args: &C::Args) -> Result<C::Output, CallError> {
        self.shared.call::<C>(args, true)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub(crate) fn enter_handler(&self) -> HandlerScope {
        RUNNING_HANDLERS.with(|h| h.borrow_mut().push(self.shared));
        HandlerScope(())
    }
}

pub struct SessionBuilder {
    path: PathBuf,
    flags: CreateFlags,
    config: SwitchlessConfig,
    registrations: Vec<(CallDescriptor, Handler)>,
    stats: Arc<Stats>,
}

impl SessionBuilder {
    pub fn new<P: AsRef<Path>>(enclave_path: P) -> SessionBuilder {
        SessionBuilder {
            path: enclave_path.as_ref().to_owned(),
            flags: CreateFlags::empty(),
            config: SwitchlessConfig::default(),
            registrations: Vec::new(),
            stats: Arc::default(),
        }
    }

    pub fn flags(&mut self, flags: CreateFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    pub fn config(&mut self, config: SwitchlessConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Registers a handler that works on marshaled bytes. The dispatch table
    /// of `descriptor.direction` gets the handler.
    pub fn register_raw<F>(&mut self, descriptor: CallDescriptor, handler: F) -> &mut Self
    where
        F: Fn(&CallContext<'_>, &[u8], &mut OutputBuffer) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registrations.push((descriptor, Box::new(handler)));
        self
    }

    pub fn register<C, F>(&mut self, handler: F) -> &mut Self
    where
        C: EdgeCall,
        F: Fn(&CallContext<'_>, C::Args) -> anyhow::Result<C::Output> + Send + Sync + 'static,
    {
        self.register_raw(C::descriptor(), move |ctx, args, out| {
            let args = C::deserialize_args(args)?;
            let output = handler(ctx, args)?;
            C::serialize_output(&output, out)?;
            Ok(())
        })
    }

    /// The counters the session will update. Remain readable if `build`
    /// fails.
    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Creates the enclave and brings the session up.
    ///
    /// On failure everything done so far is undone: started workers are
    /// joined and the enclave is terminated.
    pub fn build<L: Load + ?Sized>(self, loader: &L) -> Result<Session, InitializationError> {
        let SessionBuilder {
            path,
            flags,
            config,
            registrations,
            stats,
        } = self;
        config.validate()?;

        // Tables are filled before any worker can read them.
        let mut ecalls = Dispatcher::new(Direction::Ecall);
        let mut ocalls = Dispatcher::new(Direction::Ocall);
        for (descriptor, handler) in registrations {
            match descriptor.direction {
                Direction::Ecall => ecalls.register(descriptor, handler)?,
                Direction::Ocall => ocalls.register(descriptor, handler)?,
            }
        }

        let enclave = loader
            .create(&path, flags, &config)
            .map_err(InitializationError::Create)?;

        let queue = |direction| {
            if config.enabled(direction) {
                Some(SwitchlessQueue::new(config.queue_depth))
            } else {
                None
            }
        };
        let shared = Arc::new(Shared {
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            active_calls: AtomicUsize::new(0),
            ecalls: Channel {
                queue: queue(Direction::Ecall),
                dispatcher: ecalls,
            },
            ocalls: Channel {
                queue: queue(Direction::Ocall),
                dispatcher: ocalls,
            },
            enclave,
            config: config.clone(),
            stats,
            fallback_warned: AtomicBool::new(false),
        });

        let mut pools = Vec::new();
        for &direction in &[Direction::Ecall, Direction::Ocall] {
            if !config.enabled(direction) {
                continue;
            }
            let started = WorkerPool::start(
                config.worker_count(direction),
                direction.as_str(),
                config.backoff(),
                &shared.stats,
                || DispatchWorker::new(shared.clone(), direction),
            );
            match started {
                Ok(pool) => pools.push(pool),
                Err(source) => {
                    rollback(&shared, pools);
                    return Err(InitializationError::WorkerSpawn { direction, source });
                }
            }
        }

        if let Err(e) = shared.enclave.init_switchless(&SwitchlessInfo::new(&config)) {
            rollback(&shared, pools);
            return Err(InitializationError::SwitchlessInit(e));
        }

        shared.state.store(SessionState::Active as u8, Ordering::SeqCst);
        info!(
            "Session for {} active: {} ecall handlers, {} ocall handlers, {} switchless workers",
            path.display(),
            shared.ecalls.dispatcher.len(),
            shared.ocalls.dispatcher.len(),
            pools.iter().map(WorkerPool::len).sum::<usize>()
        );
        Ok(Session {
            shared,
            pools: Mutex::new(pools),
        })
    }
}

fn rollback(shared: &Shared, pools: Vec<WorkerPool>) {
    warn!("Session initialization failed, rolling back");
    for pool in pools {
        if let Err(e) = pool.shutdown() {
            warn!("{:#}", e);
        }
    }
    if let Err(e) = shared.enclave.terminate() {
        warn!("Failed to terminate enclave: {:#}", e);
    }
    shared.state.store(SessionState::Terminated as u8, Ordering::SeqCst);
}

/// The host side of one enclave instance.
///
/// Dropping an active session terminates it.
pub struct Session {
    shared: Arc<Shared>,
    pools: Mutex<Vec<WorkerPool>>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn config(&self) -> &SwitchlessConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Slots currently `Submitted` or `Claimed`, across both queues.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// How many times the handler registered for `call_id` has run.
    pub fn invocations(&self, direction: Direction, call_id: CallId) -> Option<u64> {
        self.shared.channel(direction).dispatcher.invocations(call_id)
    }

    /// Makes a call and waits for its result.
    ///
    /// The call is switchless if `C::SWITCHLESS` is set, switchless calls are
    /// enabled for `C::DIRECTION` and the queue has a free slot. Otherwise it
    /// is trapped.
    pub fn call<C: EdgeCall>(&self, args: &C::Args) -> Result<C::Output, CallError> {
        self.shared.call::<C>(args, false)
    }

    /// Makes a call with already marshaled arguments. The argument size is
    /// not checked against `descriptor.arg_size` on this side.
    pub fn call_raw(&self, descriptor: &CallDescriptor, args: &[u8]) -> Result<Vec<u8>, CallError> {
        self.shared.call_raw(
            descriptor.direction,
            descriptor.id,
            descriptor.switchless,
            args,
            false,
            |data| Ok(data.to_vec()),
        )
    }

    /// Stops accepting calls, waits for calls in progress, stops the workers
    /// and terminates the enclave.
    ///
    /// Returns immediately if the session is already terminated. Fails
    /// without any effect when called from one of the session's own
    /// handlers, which would otherwise wait on itself.
    pub fn terminate(&self) -> anyhow::Result<()> {
        if self.shared.handler_running() {
            bail!("session cannot be terminated from one of its handlers");
        }
        let mut pools = self.pools.lock().map_err(|_| format_err!("session lock poisoned"))?;
        if self
            .shared
            .state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        info!("Draining session");
        let backoff = Backoff::new();
        while self.shared.active_calls.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }

        let mut result = Ok(());
        let in_flight = self.shared.in_flight();
        if in_flight != 0 {
            result = Err(format_err!("{} calls still in flight after draining", in_flight));
        }
        for pool in pools.drain(..) {
            let shutdown = pool.shutdown();
            if result.is_ok() {
                result = shutdown;
            }
        }
        let terminated = self.shared.enclave.terminate().context("failed to terminate enclave");
        if result.is_ok() {
            result = terminated;
        }
        self.shared.state.store(SessionState::Terminated as u8, Ordering::SeqCst);

        let stats = self.shared.stats.snapshot();
        info!(
            "Session terminated after {} calls ({} switchless, {} trapped)",
            stats.total_calls, stats.switchless_calls, stats.trapped_calls
        );
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            error!("Error terminating session: {:#}", e);
        }
    }
}
