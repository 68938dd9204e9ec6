//! `AsyncDispatcher`: the same ring-and-stealing structure as
//! [`crate::sync_dispatcher`], but callables return a suspendable future
//! instead of running to completion inline. A suspended callable hands
//! "take the next node" responsibility to its own continuation instead of
//! blocking the worker that started it, so a worker never sits idle behind
//! a slow callable while a stealable node is still waiting.
//!
//! The continuation is driven by a small hand-rolled [`std::task::Wake`]
//! implementation rather than a pulled-in executor crate: suspension points
//! here are purely cooperative (a callable yields, it never waits on real
//! I/O), so a full reactor is out of scope, the same call other bespoke
//! `Wake`-based drivers in the wider ecosystem make for similar
//! cooperative-only futures.

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, JoinHandle, Thread};

use crate::builder::{self, effective_concurrency, DispatcherBuilder};
use crate::error::{
    AggregatedCallableFailure, CallableFailure, ConfigurationError, ExecuteError, UsageError,
    UsageErrorKind,
};
use crate::latch::{BarrierGate, CompletionSlot, InstallOutcome};
use crate::log::{Event, Logger};
use crate::steal::{RingNode, StealCursor};
use crate::unwind::{self, AbortIfPanic};

struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T: Sync> Sync for SendPtr<T> {}
impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        SendPtr(self.0)
    }
}
impl<T> Copy for SendPtr<T> {}

type BoxedFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type FactoryFn = Box<dyn Fn() -> BoxedFuture + Send>;

struct AsyncWorkNode {
    next: AtomicPtr<AsyncWorkNode>,
    factory: UnsafeCell<Option<FactoryFn>>,
    in_flight: UnsafeCell<Option<BoxedFuture>>,
    index: usize,
}

// SAFETY: `factory` is written only during Configuring or dispose, both
// single-threaded with respect to this node; `in_flight` is only ever
// touched by whichever single thread currently "owns" driving this node,
// and ownership transfers atomically (worker to continuation, or
// continuation to a fresh continuation) rather than being shared.
unsafe impl Sync for AsyncWorkNode {}

impl RingNode for AsyncWorkNode {
    fn next_slot(&self) -> &AtomicPtr<AsyncWorkNode> {
        &self.next
    }
}

impl AsyncWorkNode {
    fn new(factory: Option<FactoryFn>, index: usize) -> Box<AsyncWorkNode> {
        Box::new(AsyncWorkNode {
            next: AtomicPtr::new(ptr::null_mut()),
            factory: UnsafeCell::new(factory),
            in_flight: UnsafeCell::new(None),
            index,
        })
    }

    /// # Safety
    /// The caller must ensure no other thread is concurrently reading or
    /// writing this node's factory.
    unsafe fn clear_factory(&self) {
        *self.factory.get() = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatcherState {
    Configuring,
    Idle,
    Running,
    Disposed,
}

struct ConfigState {
    nodes: Vec<Box<AsyncWorkNode>>,
    tail: *mut AsyncWorkNode,
}

// SAFETY: see the identical justification on `sync_dispatcher::ConfigState`.
unsafe impl Send for ConfigState {}

const CALLER_WORKER_INDEX: usize = usize::MAX;

pub(crate) struct Inner {
    logger: Logger,
    config: Mutex<ConfigState>,
    head: AtomicPtr<AsyncWorkNode>,
    caller_node: AtomicPtr<AsyncWorkNode>,
    initial_steal_start: AtomicPtr<AsyncWorkNode>,
    cursor: StealCursor<AsyncWorkNode>,
    sink: Mutex<Vec<CallableFailure>>,
    completion: CompletionSlot,
    gate: BarrierGate,
    state: Mutex<DispatcherState>,
    worker_capacity: usize,
    disposed: AtomicBool,
}

impl Inner {
    fn new(worker_capacity: usize, logger: Logger) -> Arc<Inner> {
        let mut sentinel = AsyncWorkNode::new(None, CALLER_WORKER_INDEX);
        let head_ptr: *mut AsyncWorkNode = sentinel.as_mut();
        sentinel.next.store(head_ptr, Ordering::Release);

        Arc::new(Inner {
            logger,
            config: Mutex::new(ConfigState {
                nodes: vec![sentinel],
                tail: head_ptr,
            }),
            head: AtomicPtr::new(head_ptr),
            caller_node: AtomicPtr::new(ptr::null_mut()),
            initial_steal_start: AtomicPtr::new(head_ptr),
            cursor: StealCursor::new(head_ptr),
            sink: Mutex::new(Vec::new()),
            completion: CompletionSlot::new(),
            gate: BarrierGate::new(),
            state: Mutex::new(DispatcherState::Configuring),
            worker_capacity,
            disposed: AtomicBool::new(false),
        })
    }
}

fn record_failure(inner: &Inner, payload: &(dyn std::any::Any + Send), node_index: usize, worker_index: usize) {
    let failure = CallableFailure::from_panic(payload, node_index);
    inner.logger.log(|| Event::CallableFailed {
        worker: worker_index,
        detail: failure.message(),
    });
    inner.sink.lock().unwrap().push(failure);
}

enum PollOutcome {
    Ready,
    Pending,
}

/// Polls the future currently installed in `node`'s `in_flight` slot once,
/// binding a fresh waker that resumes this node's chain on wake.
fn poll_node(inner: &Arc<Inner>, node: *mut AsyncWorkNode, worker_index: usize) -> PollOutcome {
    let waker = Waker::from(Arc::new(NodeWaker {
        inner: Arc::clone(inner),
        node: SendPtr(node),
        worker_index,
    }));
    let mut cx = Context::from_waker(&waker);
    let node_index = unsafe { (*node).index };

    let poll_result = unwind::halt_unwinding(|| {
        let in_flight_cell = unsafe { (*node).in_flight.get() };
        let fut = unsafe { (*in_flight_cell).as_mut() }
            .expect("poll_node called without an installed future");
        fut.as_mut().poll(&mut cx)
    });

    match poll_result {
        Ok(Poll::Ready(())) => {
            unsafe {
                *(*node).in_flight.get() = None;
            }
            PollOutcome::Ready
        }
        Ok(Poll::Pending) => PollOutcome::Pending,
        Err(payload) => {
            unsafe {
                *(*node).in_flight.get() = None;
            }
            record_failure(inner, &*payload, node_index, worker_index);
            PollOutcome::Ready
        }
    }
}

/// Drives a chain of nodes starting at `node`, synchronously running every
/// one that completes without suspending. The first node that suspends
/// installs a continuation and this call returns immediately; the
/// continuation (see [`NodeWaker`]) resumes the chain from there.
fn advance_from(inner: Arc<Inner>, mut node: *mut AsyncWorkNode, worker_index: usize) {
    loop {
        let factory_cell = unsafe { (*node).factory.get() };
        let factory_present = unsafe { (*factory_cell).is_some() };
        if !factory_present {
            inner.completion.worker_done();
            return;
        }

        let node_index = unsafe { (*node).index };
        let materialized = unwind::halt_unwinding(|| {
            let factory = unsafe { (*factory_cell).as_ref().unwrap() };
            factory()
        });

        let future = match materialized {
            Ok(future) => future,
            Err(payload) => {
                record_failure(&inner, &*payload, node_index, worker_index);
                node = unsafe { inner.cursor.take_next() };
                continue;
            }
        };

        unsafe {
            *(*node).in_flight.get() = Some(future);
        }

        match poll_node(&inner, node, worker_index) {
            PollOutcome::Ready => {
                node = unsafe { inner.cursor.take_next() };
                continue;
            }
            PollOutcome::Pending => return,
        }
    }
}

struct NodeWaker {
    inner: Arc<Inner>,
    node: SendPtr<AsyncWorkNode>,
    worker_index: usize,
}

impl Wake for NodeWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        match poll_node(&self.inner, self.node.0, self.worker_index) {
            PollOutcome::Pending => {}
            PollOutcome::Ready => {
                let next = unsafe { self.inner.cursor.take_next() };
                advance_from(Arc::clone(&self.inner), next, self.worker_index);
            }
        }
    }
}

fn worker_main(weak: Weak<Inner>, index: usize, start: SendPtr<AsyncWorkNode>, logger: Logger) {
    let abort_guard = AbortIfPanic;
    logger.log(|| Event::WorkerStarted { worker: index });
    loop {
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        inner.logger.log(|| Event::WorkerParked { worker: index });
        inner.gate.signal_and_wait();
        if inner.disposed.load(Ordering::Acquire) {
            inner.gate.remove_participant();
            break;
        }
        advance_from(Arc::clone(&inner), start.0, index);
    }
    logger.log(|| Event::WorkerTerminated { worker: index });
    std::mem::forget(abort_guard);
}

/// A single cycle's completion, returned by
/// [`AsyncDispatcher::execute_and_wait_async`]. Supports both the
/// asynchronous consumer pattern (`.await` it, or poll it through any
/// executor) and, via [`AsyncDispatcher::execute_and_wait_blocking`], the
/// blocking one.
pub struct CompletionFuture {
    inner: Arc<Inner>,
    head: SendPtr<AsyncWorkNode>,
    saved_next: SendPtr<AsyncWorkNode>,
}

impl CompletionFuture {
    fn finish(&self) -> Result<(), AggregatedCallableFailure> {
        unsafe {
            (*self.head.0).next.store(self.saved_next.0, Ordering::Release);
        }
        let failures = std::mem::take(&mut *self.inner.sink.lock().unwrap());
        {
            let mut state = self.inner.state.lock().unwrap();
            *state = DispatcherState::Idle;
        }
        self.inner.logger.log(|| Event::CycleCompleted {
            failures: failures.len(),
        });
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregatedCallableFailure::new(failures))
        }
    }
}

impl Future for CompletionFuture {
    type Output = Result<(), AggregatedCallableFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.inner.completion.is_fired() {
            return Poll::Ready(self.finish());
        }
        let waker = cx.waker().clone();
        match self.inner.completion.install(Box::new(move || waker.wake())) {
            InstallOutcome::AlreadyFired => Poll::Ready(self.finish()),
            InstallOutcome::Installed => Poll::Pending,
        }
    }
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }
    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Minimal single-future executor for the blocking consumer pattern: parks
/// the calling thread between polls instead of spinning.
fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = Box::pin(future);
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => thread::park(),
        }
    }
}

/// Registers a fixed set of callables returning suspendable futures of no
/// value and runs them all in parallel on every
/// [`AsyncDispatcher::execute_and_wait_async`]/
/// [`AsyncDispatcher::execute_and_wait_blocking`] call.
pub struct AsyncDispatcher {
    inner: Arc<Inner>,
    builder: DispatcherBuilder,
    workers: Vec<Option<JoinHandle<()>>>,
}

impl AsyncDispatcher {
    pub fn new(max_concurrency: i32) -> Result<Self, ConfigurationError> {
        DispatcherBuilder::new()
            .num_threads(max_concurrency)
            .build_async()
    }

    pub(crate) fn from_builder(builder: DispatcherBuilder) -> Result<Self, ConfigurationError> {
        let max_concurrency = effective_concurrency(builder.num_threads)?;
        let worker_capacity = max_concurrency.saturating_sub(1);
        let inner = Inner::new(worker_capacity, Logger::new());
        Ok(AsyncDispatcher {
            inner,
            builder,
            workers: (0..worker_capacity).map(|_| None).collect(),
        })
    }

    /// Appends a callable. Identical usage rules to
    /// `SyncDispatcher::add`; see there for the starting-node/worker
    /// assignment policy.
    pub fn add<F, Fut>(&mut self, action: F) -> Result<(), UsageError>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                DispatcherState::Disposed => {
                    return Err(UsageError::new(UsageErrorKind::Disposed))
                }
                DispatcherState::Running => {
                    return Err(UsageError::new(UsageErrorKind::RunningCycle))
                }
                DispatcherState::Configuring | DispatcherState::Idle => {
                    *state = DispatcherState::Idle;
                }
            }
        }

        let factory: FactoryFn = Box::new(move || Box::pin(action()) as BoxedFuture);

        let node_ptr = {
            let mut config = self.inner.config.lock().unwrap();
            let index = config.nodes.len() - 1;
            let head_ptr = self.inner.head.load(Ordering::Relaxed);
            let mut node = AsyncWorkNode::new(Some(factory), index);
            node.next.store(head_ptr, Ordering::Release);
            let node_ptr: *mut AsyncWorkNode = node.as_mut();
            unsafe {
                (*config.tail).next.store(node_ptr, Ordering::Release);
            }
            config.tail = node_ptr;
            config.nodes.push(node);
            node_ptr
        };

        let index = unsafe { (*node_ptr).index };
        if index == 0 {
            self.inner.caller_node.store(node_ptr, Ordering::Release);
        } else if index <= self.inner.worker_capacity {
            let slot = index - 1;
            let weak = Arc::downgrade(&self.inner);
            let logger = self.inner.logger.clone();
            let send_ptr = SendPtr(node_ptr);
            // Must be raised before the thread is spawned: once spawned, the
            // worker races straight to the gate, and if it gets there before
            // this call the gate's participant count would still be 1 and
            // the worker's own arrival would fire it prematurely.
            self.inner.gate.add_participant();
            let handle = builder::spawn_thread(&mut self.builder, slot, move || {
                worker_main(weak, slot, send_ptr, logger);
            })
            .expect("failed to spawn fanout worker thread");
            self.workers[slot] = Some(handle);
        } else if index == self.inner.worker_capacity + 1 {
            self.inner
                .initial_steal_start
                .store(node_ptr, Ordering::Release);
        }

        Ok(())
    }

    /// Triggers one cycle and returns a future that completes once every
    /// callable (including ones still suspended when this call returns)
    /// has finished. The cycle's own fan-out and the caller's share of the
    /// work happen synchronously inside this call; only suspension beyond
    /// that is deferred to the returned future.
    pub fn execute_and_wait_async(&self) -> Result<CompletionFuture, UsageError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                DispatcherState::Disposed => return Err(UsageError::new(UsageErrorKind::Disposed)),
                DispatcherState::Running => {
                    return Err(UsageError::new(UsageErrorKind::RunningCycle))
                }
                DispatcherState::Configuring => {
                    return Err(UsageError::new(UsageErrorKind::NoCallablesRegistered))
                }
                DispatcherState::Idle => *state = DispatcherState::Running,
            }
        }

        let caller_node = self.inner.caller_node.load(Ordering::Acquire);
        let head_ptr = self.inner.head.load(Ordering::Acquire);
        let initial_steal = self.inner.initial_steal_start.load(Ordering::Acquire);
        self.inner.cursor.reset(initial_steal);

        let saved_next = unsafe { (*head_ptr).next.load(Ordering::Acquire) };
        unsafe {
            (*head_ptr).next.store(head_ptr, Ordering::Release);
        }

        let spawned_workers = self.workers.iter().filter(|w| w.is_some()).count();
        self.inner.completion.reset(spawned_workers + 1);

        self.inner.logger.log(|| Event::CycleStarted {
            nodes: self.inner.config.lock().unwrap().nodes.len() - 1,
        });

        self.inner.gate.signal_and_wait();

        advance_from(Arc::clone(&self.inner), caller_node, CALLER_WORKER_INDEX);

        Ok(CompletionFuture {
            inner: Arc::clone(&self.inner),
            head: SendPtr(head_ptr),
            saved_next: SendPtr(saved_next),
        })
    }

    /// Convenience wrapper for harnesses that want to block the calling
    /// thread instead of integrating with an executor: triggers a cycle
    /// and parks until it completes.
    pub fn execute_and_wait_blocking(&self) -> Result<(), ExecuteError> {
        let future = self.execute_and_wait_async()?;
        block_on(future).map_err(ExecuteError::from)
    }

    pub fn dispose(&mut self) -> Result<(), UsageError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                DispatcherState::Disposed => {
                    return Err(UsageError::new(UsageErrorKind::DoubleDispose))
                }
                DispatcherState::Running => {
                    return Err(UsageError::new(UsageErrorKind::RunningCycle))
                }
                _ => *state = DispatcherState::Disposed,
            }
        }

        self.inner.caller_node.store(ptr::null_mut(), Ordering::Release);
        {
            let config = self.inner.config.lock().unwrap();
            for node in config.nodes.iter().skip(1) {
                unsafe {
                    node.clear_factory();
                }
            }
        }
        self.inner.disposed.store(true, Ordering::Release);

        self.inner.gate.signal_and_wait();

        for handle in self.workers.iter_mut().filter_map(Option::take) {
            let _ = handle.join();
        }

        self.inner.logger.log(|| Event::Flush);
        Ok(())
    }
}

impl Drop for AsyncDispatcher {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}
