//! Engine crate for the fanout work dispatcher: the ring, the steal
//! cursor, the rendezvous/completion primitives, and the two dispatcher
//! variants built on top of them. `fanout` re-exports the public surface;
//! application code should depend on that crate, not this one.

mod async_dispatcher;
mod builder;
mod error;
mod latch;
mod log;
mod steal;
mod sync_dispatcher;
mod unwind;

pub use async_dispatcher::{AsyncDispatcher, CompletionFuture};
pub use builder::DispatcherBuilder;
pub use error::{
    AggregatedCallableFailure, CallableFailure, ConfigurationError, ExecuteError, UsageError,
};
pub use sync_dispatcher::SyncDispatcher;
