//! Panic handling helpers shared by the sync and async engines.
//!
//! Worker threads are not supposed to panic: a panic escaping the main loop
//! would leave the ring, the steal cursor, or the barrier's participant
//! count in an inconsistent state, and other threads may already be relying
//! on that state. So instead of letting such a panic unwind and silently
//! kill one worker, we abort the whole process instead of letting it
//! unwind silently.
//!
//! Callable panics are a different story: those are expected, caught with
//! [`halt_unwinding`], and routed into the `ExceptionSink` instead.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::Result as ThreadResult;

/// Aborts the process on drop, unless [`std::mem::forget`]-ed first.
///
/// Place one of these on the stack around code that must not panic; forget
/// it right before returning normally.
pub(crate) struct AbortIfPanic;

impl Drop for AbortIfPanic {
    fn drop(&mut self) {
        eprintln!("fanout: internal invariant violated, aborting process");
        std::process::abort();
    }
}

/// Catches a panic from `func`, returning it as an `Err` instead of
/// unwinding further.
pub(crate) fn halt_unwinding<F, R>(func: F) -> ThreadResult<R>
where
    F: FnOnce() -> R,
{
    panic::catch_unwind(AssertUnwindSafe(func))
}

/// Extracts a human-readable message from a caught panic payload.
pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callable panicked with a non-string payload".to_string()
    }
}
