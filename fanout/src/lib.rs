//! Low-overhead concurrent work dispatcher for benchmarking the cost of
//! running short callables simultaneously from multiple threads.
//!
//! Register a fixed set of callables once, then trigger as many cycles as
//! needed; each trigger fans every callable out across worker threads and
//! blocks (or, for [`AsyncDispatcher`], returns a future) until they have
//! all finished. No per-cycle heap allocation happens on the dispatcher's
//! own hot path; registering callables is the only allocating step.
//!
//! ```no_run
//! use fanout::SyncDispatcher;
//!
//! let mut dispatcher = SyncDispatcher::new(4)?;
//! dispatcher.add(|| { /* ... */ })?;
//! dispatcher.add(|| { /* ... */ })?;
//! dispatcher.execute_and_wait()?;
//! dispatcher.dispose()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use fanout_core::{
    AggregatedCallableFailure, AsyncDispatcher, CallableFailure, CompletionFuture,
    ConfigurationError, DispatcherBuilder, ExecuteError, SyncDispatcher, UsageError,
};
