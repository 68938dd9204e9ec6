//! `SyncDispatcher`: registers zero-argument, no-return callables and runs
//! all of them in parallel on every `execute_and_wait()` call, blocking the
//! caller until every one of them has finished.
//!
//! Structurally this is a `Registry`/`WorkerThread`/`main_loop` triad: a
//! fixed-callable-set, cycle-triggered dispatcher where workers park on a
//! [`BarrierGate`] between cycles instead of sleeping on a condvar waiting
//! for arbitrary injected jobs, and the work they run each cycle comes from
//! a closed [`steal::StealCursor`] ring instead of per-worker deques.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crate::builder::{self, effective_concurrency, DispatcherBuilder};
use crate::error::{
    AggregatedCallableFailure, CallableFailure, ConfigurationError, ExecuteError, UsageError,
    UsageErrorKind,
};
use crate::latch::{BarrierGate, CompletionGate};
use crate::log::{Event, Logger};
use crate::steal::{RingNode, StealCursor};
use crate::unwind::{self, AbortIfPanic};

/// Points at a `WorkNode` owned elsewhere; only ever handed to the one
/// worker thread that is the node's designated starting point, so moving
/// it across the thread boundary is sound even though raw pointers are not
/// `Send` by default.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        SendPtr(self.0)
    }
}
impl<T> Copy for SendPtr<T> {}

struct WorkNode {
    next: AtomicPtr<WorkNode>,
    action: UnsafeCell<Box<dyn Fn() + Send>>,
    index: usize,
}

// SAFETY: `action` is written only during Configuring (single thread, under
// `Inner::config`) or during `dispose` (also single-threaded, and only once
// no cycle can be running), and is read-only for the duration of every
// Running cycle; `next` is always accessed through `AtomicPtr`.
unsafe impl Sync for WorkNode {}

impl RingNode for WorkNode {
    fn next_slot(&self) -> &AtomicPtr<WorkNode> {
        &self.next
    }
}

impl WorkNode {
    fn new(action: Box<dyn Fn() + Send>, index: usize) -> Box<WorkNode> {
        Box::new(WorkNode {
            next: AtomicPtr::new(ptr::null_mut()),
            action: UnsafeCell::new(action),
            index,
        })
    }

    /// # Safety
    /// The caller must ensure no other thread is concurrently calling
    /// `run` or `set_action` on the same node.
    unsafe fn run(&self) {
        (*self.action.get())()
    }

    /// # Safety
    /// The caller must ensure no other thread is concurrently reading or
    /// writing this node's action (only sound while the dispatcher is
    /// Idle and about to become Disposed).
    unsafe fn set_action(&self, action: Box<dyn Fn() + Send>) {
        *self.action.get() = action;
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
    /// Owns every node, including the head sentinel at index 0. Addresses
    /// are stable across `Vec` growth because each element is itself a
    /// `Box`.
    nodes: Vec<Box<WorkNode>>,
    tail: *mut WorkNode,
}

// SAFETY: `tail` always points at one of the `WorkNode`s this same struct
// owns via `nodes`; the whole struct only ever moves across threads inside
// a `Mutex`.
unsafe impl Send for ConfigState {}

/// The marker used for the caller's own slot in logs; real worker indices
/// are always `< worker_capacity`.
const CALLER_WORKER_INDEX: usize = usize::MAX;

pub(crate) struct Inner {
    logger: Logger,
    config: Mutex<ConfigState>,
    head: AtomicPtr<WorkNode>,
    caller_node: AtomicPtr<WorkNode>,
    initial_steal_start: AtomicPtr<WorkNode>,
    cursor: StealCursor<WorkNode>,
    sink: Mutex<Vec<CallableFailure>>,
    completion: CompletionGate,
    gate: BarrierGate,
    state: Mutex<DispatcherState>,
    worker_capacity: usize,
    disposed: AtomicBool,
}

impl Inner {
    fn new(worker_capacity: usize, logger: Logger) -> Arc<Inner> {
        let mut sentinel = WorkNode::new(Box::new(|| {}), CALLER_WORKER_INDEX);
        let head_ptr: *mut WorkNode = sentinel.as_mut();
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
            completion: CompletionGate::new(),
            gate: BarrierGate::new(),
            state: Mutex::new(DispatcherState::Configuring),
            worker_capacity,
            disposed: AtomicBool::new(false),
        })
    }
}

/// Runs `start`, then keeps stealing and running further nodes from the
/// shared cursor until it returns the sentinel. Shared by the caller thread
/// (starting from the caller node) and every worker thread (starting from
/// its assigned starting node).
unsafe fn drain_from(inner: &Inner, start: *mut WorkNode, worker_index: usize) {
    let head_ptr = inner.head.load(Ordering::Acquire);
    let mut node = start;
    loop {
        if node == head_ptr {
            return;
        }
        execute_node(inner, node, worker_index);
        node = inner.cursor.take_next();
        if node != head_ptr {
            inner.logger.log(|| Event::NodeStolen {
                worker: worker_index,
            });
        }
    }
}

fn execute_node(inner: &Inner, node: *mut WorkNode, worker_index: usize) {
    let result = unwind::halt_unwinding(|| unsafe { (*node).run() });
    if let Err(payload) = result {
        let node_index = unsafe { (*node).index };
        let failure = CallableFailure::from_panic(&*payload, node_index);
        inner.logger.log(|| Event::CallableFailed {
            worker: worker_index,
            detail: failure.message(),
        });
        inner.sink.lock().unwrap().push(failure);
    }
}

fn worker_main(weak: Weak<Inner>, index: usize, start: SendPtr<WorkNode>, logger: Logger) {
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
        unsafe {
            drain_from(&inner, start.0, index);
        }
        inner.completion.worker_done();
    }
    logger.log(|| Event::WorkerTerminated { worker: index });
    std::mem::forget(abort_guard);
}

/// Registers a fixed set of zero-argument callables and runs them all in
/// parallel on every [`SyncDispatcher::execute_and_wait`] call, blocking the
/// caller until every one of them has finished.
pub struct SyncDispatcher {
    inner: Arc<Inner>,
    builder: DispatcherBuilder,
    workers: Vec<Option<JoinHandle<()>>>,
}

impl SyncDispatcher {
    /// `max_concurrency = -1` uses the available parallelism; otherwise
    /// must be `>= 1`.
    pub fn new(max_concurrency: i32) -> Result<Self, ConfigurationError> {
        DispatcherBuilder::new()
            .num_threads(max_concurrency)
            .build_sync()
    }

    pub(crate) fn from_builder(builder: DispatcherBuilder) -> Result<Self, ConfigurationError> {
        let max_concurrency = effective_concurrency(builder.num_threads)?;
        let worker_capacity = max_concurrency.saturating_sub(1);
        let inner = Inner::new(worker_capacity, Logger::new());
        Ok(SyncDispatcher {
            inner,
            builder,
            workers: (0..worker_capacity).map(|_| None).collect(),
        })
    }

    /// Appends a callable. Not thread-safe; forbidden once a cycle has
    /// started. The first callable added becomes the caller node, executed
    /// directly by `execute_and_wait`'s caller; the next `maxConcurrency - 1`
    /// each get a dedicated worker thread; anything beyond that is claimed
    /// by whichever thread finishes its own work first.
    pub fn add<F>(&mut self, action: F) -> Result<(), UsageError>
    where
        F: Fn() + Send + 'static,
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

        let node_ptr = {
            let mut config = self.inner.config.lock().unwrap();
            let index = config.nodes.len() - 1;
            let head_ptr = self.inner.head.load(Ordering::Relaxed);
            let mut node = WorkNode::new(Box::new(action), index);
            node.next.store(head_ptr, Ordering::Release);
            let node_ptr: *mut WorkNode = node.as_mut();
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

    /// Triggers one cycle: runs every registered callable in parallel and
    /// blocks until all of them have finished. Not thread-safe; must be
    /// called by the same thread that configured the dispatcher, one call
    /// at a time.
    pub fn execute_and_wait(&self) -> Result<(), ExecuteError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                DispatcherState::Disposed => {
                    return Err(UsageError::new(UsageErrorKind::Disposed).into())
                }
                DispatcherState::Running => {
                    return Err(UsageError::new(UsageErrorKind::RunningCycle).into())
                }
                DispatcherState::Configuring => {
                    return Err(UsageError::new(UsageErrorKind::NoCallablesRegistered).into())
                }
                DispatcherState::Idle => {
                    *state = DispatcherState::Running;
                }
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

        unsafe {
            drain_from(&self.inner, caller_node, CALLER_WORKER_INDEX);
        }
        self.inner.completion.worker_done();
        self.inner.completion.wait();

        unsafe {
            (*head_ptr).next.store(saved_next, Ordering::Release);
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
            Err(AggregatedCallableFailure::new(failures).into())
        }
    }

    /// Tears the dispatcher down: wakes every worker thread and joins it,
    /// so nothing is left runnable once this returns. Idempotent semantics
    /// are implemented (a second call fails cleanly with `UsageError`
    /// rather than re-entering teardown) but the documented contract is to
    /// call this exactly once.
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
                    node.set_action(Box::new(|| {}));
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

impl Drop for SyncDispatcher {
    fn drop(&mut self) {
        // Best-effort: if the user already disposed cleanly this is a
        // harmless double-dispose error we swallow; if they never did, this
        // is what actually wakes and joins the worker threads instead of
        // leaking them.
        let _ = self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn single_callable_runs_on_caller_thread() {
        let mut dispatcher = SyncDispatcher::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        dispatcher.add(move || { c.fetch_add(1, Ordering::SeqCst); }).unwrap();
        dispatcher.execute_and_wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn range_check_rejects_invalid_concurrency() {
        assert!(SyncDispatcher::new(0).is_err());
        assert!(SyncDispatcher::new(-2).is_err());
        assert!(SyncDispatcher::new(1).is_ok());
        assert!(SyncDispatcher::new(-1).is_ok());
    }

    #[test]
    fn trigger_with_no_callables_is_a_usage_error() {
        let dispatcher = SyncDispatcher::new(2).unwrap();
        match dispatcher.execute_and_wait() {
            Err(ExecuteError::Usage(_)) => {}
            other => panic!("expected UsageError, got {other:?}"),
        }
    }
}
