//! Owning contexts and their run loops.
//!
//! An owning context is a single thread that services marshaled calls one at a
//! time, in the order they were queued. Two flavours exist:
//!
//! - [`RunLoop`] is bound to the thread that creates it (typically the UI thread)
//!   and is pumped explicitly with [`RunLoop::run_pending`] or [`RunLoop::run_until`].
//! - [`OwningContext`] spawns a dedicated thread that runs the loop until shut down.
//!   Worker threads for device I/O are owning contexts too.
//!
//! Both are fed through a cloneable [`ContextHandle`]. The queue is a Tokio
//! unbounded mpsc channel; calling threads that must wait park on a oneshot reply
//! with `blocking_recv`, so no thread ever spins.
//!
//! ```text
//! caller thread                         owning thread
//! -------------                         -------------
//! post(guard, Blocking, op)
//!   ├─ same thread? ──> run op inline
//!   └─ send CallDescriptor ──mpsc──>    RunLoop services descriptor
//!      blocking_recv() <──oneshot──       guard alive? run op : TargetDestroyed
//! ```
//!
//! Blocking calls that would close a wait cycle (context A parked on B while B
//! blocks on A) are refused with [`MarshalError::ReentrantCall`].

use super::call::{invoke, CallDescriptor, CallReport, DispatchMode, Outcome};
use super::functor::MarshaledFn;
use crate::error::MarshalError;
use crate::events::{CoreEvent, EventSink};
use crate::guard::{GuardRef, Target};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Serializes the check-and-set of wait edges between contexts.
static WAIT_GRAPH: Mutex<()> = parking_lot::const_mutex(());

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Arc<ContextShared>>> = const { RefCell::new(None) };
}

enum Envelope {
    Call(CallDescriptor),
    Shutdown,
}

/// Counters for one context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Calls that ran to completion.
    pub executed: u64,
    /// Calls dropped because their target was destroyed.
    pub dropped: u64,
    /// Calls whose operation failed.
    pub failed: u64,
}

#[derive(Default)]
struct StatCounters {
    executed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

pub(crate) struct ContextShared {
    id: u64,
    name: String,
    thread: OnceLock<ThreadId>,
    /// Context this one is currently parked on, if any.
    waiting_on: Mutex<Option<Arc<ContextShared>>>,
    events: Arc<dyn EventSink>,
    stats: StatCounters,
}

impl ContextShared {
    fn new(name: String, events: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            thread: OnceLock::new(),
            waiting_on: Mutex::new(None),
            events,
            stats: StatCounters::default(),
        })
    }

    fn is_current_thread(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    fn record(&self, guard: &GuardRef, mode: DispatchMode, report: CallReport) {
        match report {
            CallReport::Completed => {
                self.stats.executed.fetch_add(1, Ordering::Relaxed);
            }
            CallReport::TargetDestroyed => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.events.emit(CoreEvent::TargetDestroyed {
                    target: guard.id(),
                    label: guard.label().to_string(),
                    context: self.name.clone(),
                });
            }
            CallReport::Failed(details) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(CoreEvent::ExceptionInCall {
                    context: self.name.clone(),
                    label: guard.label().to_string(),
                    details,
                    asynchronous: mode == DispatchMode::FireAndForget,
                });
            }
        }
    }
}

/// Marks the current context as parked on another one for the lifetime of the
/// value.
pub(crate) struct WaitEdge {
    from: Option<Arc<ContextShared>>,
}

impl WaitEdge {
    /// Fails with [`MarshalError::ReentrantCall`] if `to` is already (transitively)
    /// parked on the calling context.
    pub(crate) fn enter(to: &Arc<ContextShared>) -> Result<Self, MarshalError> {
        let Some(from) = CURRENT_CONTEXT.with(|c| c.borrow().clone()) else {
            // Plain threads are never serviced by a run loop, so they cannot be
            // part of a cycle.
            return Ok(Self { from: None });
        };

        let _graph = WAIT_GRAPH.lock();
        let mut next = Some(Arc::clone(to));
        while let Some(ctx) = next {
            if ctx.id == from.id {
                return Err(MarshalError::ReentrantCall {
                    from: from.name.clone(),
                    to: to.name.clone(),
                });
            }
            next = ctx.waiting_on.lock().clone();
        }
        *from.waiting_on.lock() = Some(Arc::clone(to));
        Ok(Self { from: Some(from) })
    }
}

impl Drop for WaitEdge {
    fn drop(&mut self) {
        if let Some(from) = &self.from {
            let _graph = WAIT_GRAPH.lock();
            *from.waiting_on.lock() = None;
        }
    }
}

/// Posting side of an owning context. Cheap to clone; usable from any thread.
#[derive(Clone)]
pub struct ContextHandle {
    shared: Arc<ContextShared>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ContextHandle {
    /// Name of the context, used in logs and events.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the calling thread is this context's thread.
    pub fn is_current(&self) -> bool {
        self.shared.is_current_thread()
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    /// Whether the run loop still accepts calls.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Counters for calls serviced so far.
    pub fn stats(&self) -> ContextStats {
        ContextStats {
            executed: self.shared.stats.executed.load(Ordering::Relaxed),
            dropped: self.shared.stats.dropped.load(Ordering::Relaxed),
            failed: self.shared.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Creates a target owned by an object living in this context.
    pub fn register_target(&self, label: impl Into<String>) -> Target {
        Target::attach(label, self.shared.name.clone())
    }

    /// Marshals `op` to this context.
    ///
    /// In [`DispatchMode::Blocking`] the calling thread parks until the call has run
    /// (or was refused because `guard` is dead). If the caller already is this
    /// context's thread, `op` runs inline. In [`DispatchMode::FireAndForget`] the
    /// call is queued and [`Outcome::Dispatched`] is returned at once.
    pub fn post<R, F>(&self, guard: &GuardRef, mode: DispatchMode, op: F) -> Outcome<R>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        match mode {
            DispatchMode::Blocking => match self.call(guard, op) {
                Ok(value) => Outcome::Success(value),
                Err(err) => Outcome::Failed(err),
            },
            DispatchMode::FireAndForget => self.queue_async(guard, op),
        }
    }

    /// Blocking form of [`post`](Self::post).
    pub fn call<R, F>(&self, guard: &GuardRef, op: F) -> Result<R, MarshalError>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return self.call_inline(guard, op);
        }

        let _edge = WaitEdge::enter(&self.shared).map_err(|err| {
            error!(context = %self.shared.name, error = %err, "refusing re-entrant blocking call");
            err
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let desc = CallDescriptor::blocking(guard.clone(), op, reply_tx);
        if self.tx.send(Envelope::Call(desc)).is_err() {
            return Err(MarshalError::ContextClosed(self.shared.name.clone()));
        }
        trace!(context = %self.shared.name, target = %guard.label(), "waiting for marshaled call");

        match reply_rx.blocking_recv() {
            Ok(result) => result,
            // Descriptor dropped unserviced: the loop is gone.
            Err(_) => Err(MarshalError::ContextClosed(self.shared.name.clone())),
        }
    }

    /// Fire-and-forget form of [`post`](Self::post).
    pub fn call_async<R, F>(&self, guard: &GuardRef, op: F)
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let _ = self.queue_async(guard, op);
    }

    /// Wraps `f` so it can be invoked from any thread and always runs here.
    pub fn bind<A, R, F>(&self, guard: &GuardRef, f: F) -> MarshaledFn<A, R>
    where
        F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
        A: Send + 'static,
        R: Send + 'static,
    {
        MarshaledFn::new(self.clone(), guard.clone(), f)
    }

    /// Asks the run loop to stop once it reaches this point in the queue.
    pub fn request_stop(&self) {
        let _ = self.tx.send(Envelope::Shutdown);
    }

    fn call_inline<R, F>(&self, guard: &GuardRef, op: F) -> Result<R, MarshalError>
    where
        F: FnOnce() -> anyhow::Result<R>,
    {
        if !guard.is_alive() {
            self.shared
                .record(guard, DispatchMode::Blocking, CallReport::TargetDestroyed);
            return Err(MarshalError::TargetDestroyed);
        }
        match invoke(op) {
            Ok(value) => {
                self.shared
                    .record(guard, DispatchMode::Blocking, CallReport::Completed);
                Ok(value)
            }
            Err(err) => {
                self.shared.record(
                    guard,
                    DispatchMode::Blocking,
                    CallReport::Failed(err.to_string()),
                );
                Err(err)
            }
        }
    }

    fn queue_async<R, F>(&self, guard: &GuardRef, op: F) -> Outcome<R>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let desc = CallDescriptor::fire_and_forget(guard.clone(), op);
        if self.tx.send(Envelope::Call(desc)).is_err() {
            debug!(context = %self.shared.name, target = %guard.label(), "async call to stopped context dropped");
            return Outcome::Failed(MarshalError::ContextClosed(self.shared.name.clone()));
        }
        Outcome::Dispatched
    }
}

/// A run loop bound to the thread that created it.
///
/// Not `Send`: the loop must be pumped by its own thread.
pub struct RunLoop {
    shared: Arc<ContextShared>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    stopped: bool,
    timer: Option<tokio::runtime::Runtime>,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("name", &self.shared.name)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl RunLoop {
    /// Creates a run loop owned by the calling thread.
    pub fn new(name: impl Into<String>, events: Arc<dyn EventSink>) -> (Self, ContextHandle) {
        let shared = ContextShared::new(name.into(), events);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ContextHandle {
            shared: Arc::clone(&shared),
            tx,
        };
        (Self::bind(shared, rx), handle)
    }

    fn bind(shared: Arc<ContextShared>, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        let _ = shared.thread.set(thread::current().id());
        CURRENT_CONTEXT.with(|c| {
            let mut current = c.borrow_mut();
            if let Some(previous) = current.as_ref() {
                warn!(
                    previous = %previous.name,
                    next = %shared.name,
                    "thread already owned a run loop; rebinding"
                );
            }
            *current = Some(Arc::clone(&shared));
        });
        Self {
            shared,
            rx,
            stopped: false,
            timer: None,
            _not_send: PhantomData,
        }
    }

    /// Name of this context.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether a stop request has been serviced. A stopped loop refuses new calls.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Services every call already queued without waiting for more.
    /// Returns the number of calls serviced.
    pub fn run_pending(&mut self) -> usize {
        let mut serviced = 0;
        while !self.stopped {
            match self.rx.try_recv() {
                Ok(envelope) => serviced += self.dispatch(envelope),
                Err(_) => break,
            }
        }
        serviced
    }

    /// Services calls until a stop request arrives or every handle is dropped.
    pub fn run(&mut self) {
        debug!(context = %self.shared.name, "run loop started");
        while !self.stopped {
            match self.rx.blocking_recv() {
                Some(envelope) => {
                    self.dispatch(envelope);
                }
                None => break,
            }
        }
        let _ = self.drain();
        debug!(context = %self.shared.name, "run loop stopped");
    }

    /// Services calls until `done` returns `true`, checking it after every call.
    /// Gives up after `timeout` and returns whether `done` was satisfied.
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            if self.stopped {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Short slices keep `done` responsive to state changed by other threads.
            let slice = (deadline - now).min(Duration::from_millis(10));
            if let Some(envelope) = self.recv_timeout(slice) {
                self.dispatch(envelope);
            }
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        if self.timer.is_none() {
            match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => self.timer = Some(rt),
                Err(err) => {
                    error!(context = %self.shared.name, error = %err, "failed to build timer runtime");
                    thread::sleep(timeout);
                    return self.rx.try_recv().ok();
                }
            }
        }
        let rt = self.timer.as_ref()?;
        let rx = &mut self.rx;
        rt.block_on(async { tokio::time::timeout(timeout, rx.recv()).await.ok().flatten() })
    }

    fn dispatch(&mut self, envelope: Envelope) -> usize {
        match envelope {
            Envelope::Call(desc) => {
                self.service(desc);
                1
            }
            Envelope::Shutdown => {
                self.stopped = true;
                self.drain()
            }
        }
    }

    fn service(&self, desc: CallDescriptor) {
        desc.execute(&|guard, mode, report| self.shared.record(guard, mode, report));
    }

    /// Stops accepting calls and services whatever is still queued.
    fn drain(&mut self) -> usize {
        self.rx.close();
        let mut serviced = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            if let Envelope::Call(desc) = envelope {
                self.service(desc);
                serviced += 1;
            }
        }
        if serviced > 0 {
            debug!(context = %self.shared.name, serviced, "drained calls queued behind stop request");
        }
        serviced
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        // Pending blocking callers see their reply sender dropped.
        self.rx.close();
        CURRENT_CONTEXT.with(|c| {
            let mut current = c.borrow_mut();
            if current.as_ref().map(|s| s.id) == Some(self.shared.id) {
                *current = None;
            }
        });
    }
}

/// A run loop on its own thread.
pub struct OwningContext {
    handle: ContextHandle,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for OwningContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwningContext")
            .field("name", &self.handle.name())
            .finish()
    }
}

impl OwningContext {
    /// Spawns a thread named `name` running a fresh run loop.
    pub fn spawn(name: impl Into<String>, events: Arc<dyn EventSink>) -> std::io::Result<Self> {
        let name = name.into();
        let shared = ContextShared::new(name.clone(), events);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ContextHandle {
            shared: Arc::clone(&shared),
            tx,
        };

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut run_loop = RunLoop::bind(shared, rx);
            run_loop.run();
        })?;
        info!(context = %name, "owning context started");

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// A handle for posting calls to this context.
    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    /// Stops the run loop after the calls already queued and joins its thread.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.request_stop();
        if self.handle.is_current() {
            warn!(context = %self.handle.name(), "context shut down from its own thread; not joining");
            return;
        }
        if thread.join().is_err() {
            error!(context = %self.handle.name(), "run loop thread panicked");
        }
        info!(context = %self.handle.name(), "owning context stopped");
    }

    /// Stops the run loop without joining its thread, for callers the loop may be
    /// parked on.
    pub(crate) fn stop_detached(&mut self) {
        if self.thread.take().is_some() {
            self.handle.request_stop();
            warn!(context = %self.handle.name(), "owning context stopped without join");
        }
    }
}

impl Drop for OwningContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
