//! `DispatcherBuilder`, a small configuration surface for the two
//! dispatcher kinds.

use crate::error::ConfigurationError;
use crate::async_dispatcher::AsyncDispatcher;
use crate::sync_dispatcher::SyncDispatcher;

/// Resolves `maxConcurrency`: `-1` means "use the available parallelism"
/// (unclamped, deliberately not capped to CPU count), any other value must
/// be `>= 1`.
pub(crate) fn effective_concurrency(requested: i32) -> Result<usize, ConfigurationError> {
    match requested {
        -1 => Ok(std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or_else(|_| num_cpus::get())),
        n if n >= 1 => Ok(n as usize),
        n => Err(ConfigurationError::invalid_concurrency(n)),
    }
}

/// Builds a [`SyncDispatcher`] or [`AsyncDispatcher`] with thread naming
/// and stack size control.
pub struct DispatcherBuilder {
    pub(crate) num_threads: i32,
    pub(crate) thread_name: Option<Box<dyn FnMut(usize) -> String + Send>>,
    pub(crate) stack_size: Option<usize>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        DispatcherBuilder {
            num_threads: -1,
            thread_name: None,
            stack_size: None,
        }
    }

    /// Same semantics as `SyncDispatcher::new`/`AsyncDispatcher::new`'s
    /// `maxConcurrency` argument.
    pub fn num_threads(mut self, num_threads: i32) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Names each worker thread by index.
    pub fn thread_name<F>(mut self, closure: F) -> Self
    where
        F: FnMut(usize) -> String + Send + 'static,
    {
        self.thread_name = Some(Box::new(closure));
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    pub fn build_sync(self) -> Result<SyncDispatcher, ConfigurationError> {
        SyncDispatcher::from_builder(self)
    }

    pub fn build_async(self) -> Result<AsyncDispatcher, ConfigurationError> {
        AsyncDispatcher::from_builder(self)
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn spawn_thread<F>(
    builder: &mut DispatcherBuilder,
    index: usize,
    body: F,
) -> std::io::Result<std::thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let mut thread_builder = std::thread::Builder::new();
    if let Some(name_fn) = builder.thread_name.as_mut() {
        thread_builder = thread_builder.name(name_fn(index));
    }
    if let Some(stack_size) = builder.stack_size {
        thread_builder = thread_builder.stack_size(stack_size);
    }
    thread_builder.spawn(body)
}
