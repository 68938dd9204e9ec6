//! A minimal, opt-in structured event log.
//!
//! The closure passed to [`Logger::log`] is only ever called when logging
//! is enabled,
//! so a disabled logger costs one branch and nothing else on the hot path.
//! Logging is enabled for the lifetime of a dispatcher by setting
//! `FANOUT_LOG` before constructing it; there is no way to toggle it after
//! construction, which keeps the hot-path check a single `Option::is_some`.

use std::env;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) enum Event<'a> {
    WorkerStarted { worker: usize },
    WorkerParked { worker: usize },
    CycleStarted { nodes: usize },
    NodeStolen { worker: usize },
    CallableFailed { worker: usize, detail: &'a str },
    CycleCompleted { failures: usize },
    WorkerTerminated { worker: usize },
    Flush,
}

impl fmt::Display for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct LoggerState {
    sequence: AtomicU64,
}

#[derive(Clone)]
pub(crate) struct Logger {
    inner: Option<Arc<LoggerState>>,
}

impl Logger {
    pub(crate) fn new() -> Self {
        let inner = if env::var_os("FANOUT_LOG").is_some() {
            Some(Arc::new(LoggerState {
                sequence: AtomicU64::new(0),
            }))
        } else {
            None
        };
        Logger { inner }
    }

    #[inline]
    pub(crate) fn log<'a>(&self, event: impl FnOnce() -> Event<'a>) {
        if let Some(state) = &self.inner {
            let seq = state.sequence.fetch_add(1, Ordering::Relaxed);
            eprintln!("[fanout #{seq}] {}", event());
        }
    }
}
