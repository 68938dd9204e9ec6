//! Rendezvous and completion-signalling primitives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam_utils::CachePadded;

/// A reusable N-party rendezvous with dynamic participant add/remove.
///
/// Unlike [`std::sync::Barrier`], the party count is not fixed at
/// construction: [`BarrierGate::add_participant`] and
/// [`BarrierGate::remove_participant`] can change it between cycles. The
/// dispatcher guarantees, via its single-threaded configuration discipline,
/// that these are only called while no party is blocked at the gate.
pub(crate) struct BarrierGate {
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

struct BarrierState {
    participants: usize,
    arrived: usize,
    generation: u64,
}

impl BarrierGate {
    /// Starts with a single participant: the driver.
    pub(crate) fn new() -> Self {
        BarrierGate {
            state: Mutex::new(BarrierState {
                participants: 1,
                arrived: 0,
                generation: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn add_participant(&self) {
        let mut state = self.state.lock().unwrap();
        state.participants += 1;
    }

    pub(crate) fn remove_participant(&self) {
        let mut state = self.state.lock().unwrap();
        state.participants -= 1;
    }

    /// Blocks until every registered participant has called this method,
    /// then releases them all.
    pub(crate) fn signal_and_wait(&self) {
        let mut state = self.state.lock().unwrap();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == state.participants {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.condvar.notify_all();
        } else {
            while state.generation == generation {
                state = self.condvar.wait(state).unwrap();
            }
        }
    }
}

/// The number of bounded spin iterations `CompletionGate::wait` performs
/// before escalating to a blocking condvar wait.
const SPIN_LIMIT: u32 = 1000;

/// A decrementing counter plus a wake-up mechanism, used to unblock
/// `SyncDispatcher::execute_and_wait`'s caller once every worker (plus the
/// caller itself) has finished its share of a cycle.
pub(crate) struct CompletionGate {
    pending: CachePadded<AtomicUsize>,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl CompletionGate {
    pub(crate) fn new() -> Self {
        CompletionGate {
            pending: CachePadded::new(AtomicUsize::new(0)),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Arms the gate for a new cycle with `count` outstanding parties.
    pub(crate) fn reset(&self, count: usize) {
        self.pending.store(count, Ordering::Release);
    }

    /// Called by a worker (or the caller) when its share of the cycle is
    /// done. Wakes the waiter once the count reaches zero.
    pub(crate) fn worker_done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.mutex.lock().unwrap();
            self.condvar.notify_all();
        }
    }

    /// Blocks until the count reaches zero: a bounded spin first, then an
    /// escalation to a blocking condvar wait so the caller does not burn
    /// CPU indefinitely on a long-running cycle.
    pub(crate) fn wait(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            std::hint::spin_loop();
        }

        let mut guard = self.mutex.lock().unwrap();
        while self.pending.load(Ordering::Acquire) != 0 {
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}

/// The three states of the single completion slot `AsyncDispatcher` uses in
/// place of `CompletionGate`'s blocking wait: no continuation has been
/// installed yet, the consumer's continuation is installed, or the cycle
/// has already finished.
enum CompletionState {
    Noop,
    Installed(Box<dyn FnOnce() + Send>),
    Fired,
}

pub(crate) enum InstallOutcome {
    Installed,
    AlreadyFired,
}

/// A decrementing pending counter paired with a single completion-callback
/// slot. Firing invokes whatever continuation is currently installed
/// exactly once, rather than waking a condvar.
pub(crate) struct CompletionSlot {
    pending: CachePadded<AtomicUsize>,
    state: Mutex<CompletionState>,
}

impl CompletionSlot {
    pub(crate) fn new() -> Self {
        CompletionSlot {
            pending: CachePadded::new(AtomicUsize::new(0)),
            state: Mutex::new(CompletionState::Noop),
        }
    }

    /// Arms the slot for a new cycle with `count` outstanding parties.
    pub(crate) fn reset(&self, count: usize) {
        *self.state.lock().unwrap() = CompletionState::Noop;
        self.pending.store(count, Ordering::Release);
    }

    pub(crate) fn worker_done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        let continuation = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, CompletionState::Fired) {
                CompletionState::Installed(continuation) => Some(continuation),
                CompletionState::Noop | CompletionState::Fired => None,
            }
        };
        if let Some(continuation) = continuation {
            continuation();
        }
    }

    /// Installs a continuation to run when the cycle completes. If the
    /// cycle has already completed, runs it inline instead and reports
    /// that, so the caller knows not to wait for a wake-up that will never
    /// come.
    pub(crate) fn install(&self, continuation: Box<dyn FnOnce() + Send>) -> InstallOutcome {
        let mut state = self.state.lock().unwrap();
        match *state {
            CompletionState::Fired => {
                drop(state);
                continuation();
                InstallOutcome::AlreadyFired
            }
            CompletionState::Noop | CompletionState::Installed(_) => {
                *state = CompletionState::Installed(continuation);
                InstallOutcome::Installed
            }
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        matches!(*self.state.lock().unwrap(), CompletionState::Fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn barrier_gate_releases_all_participants_together() {
        let gate = Arc::new(BarrierGate::new());
        gate.add_participant();
        gate.add_participant();
        let arrived = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let arrived = Arc::clone(&arrived);
                thread::spawn(move || {
                    gate.signal_and_wait();
                    arrived.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // The driver is the third participant; nothing proceeds until it
        // arrives.
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(arrived.load(Ordering::SeqCst), 0);
        gate.signal_and_wait();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(arrived.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn completion_gate_wakes_waiter_after_all_workers_report_done() {
        let gate = Arc::new(CompletionGate::new());
        gate.reset(4);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.worker_done())
            })
            .collect();
        gate.wait();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn completion_slot_invokes_continuation_installed_before_fire() {
        let slot = Arc::new(CompletionSlot::new());
        slot.reset(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let outcome = slot.install(Box::new(move || {
            f.store(1, Ordering::SeqCst);
        }));
        assert!(matches!(outcome, InstallOutcome::Installed));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        slot.worker_done();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_slot_invokes_continuation_inline_when_installed_after_fire() {
        let slot = CompletionSlot::new();
        slot.reset(1);
        slot.worker_done();
        assert!(slot.is_fired());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let outcome = slot.install(Box::new(move || {
            f.store(1, Ordering::SeqCst);
        }));
        assert!(matches!(outcome, InstallOutcome::AlreadyFired));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
