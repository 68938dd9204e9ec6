//! A hand-rolled error hierarchy: a private `*Kind` enum behind a public,
//! opaque error struct, each implementing `std::error::Error`/`Display` by
//! hand rather than deriving them.

use std::error::Error;
use std::fmt;

#[derive(Debug)]
enum ConfigurationErrorKind {
    InvalidConcurrency(i32),
}

/// Returned when a dispatcher is configured with an invalid
/// `maxConcurrency`.
#[derive(Debug)]
pub struct ConfigurationError {
    kind: ConfigurationErrorKind,
}

impl ConfigurationError {
    pub(crate) fn invalid_concurrency(requested: i32) -> Self {
        ConfigurationError {
            kind: ConfigurationErrorKind::InvalidConcurrency(requested),
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConfigurationErrorKind::InvalidConcurrency(n) => write!(
                f,
                "invalid maxConcurrency {n}: must be >= 1, or exactly -1 to use the \
                 available parallelism"
            ),
        }
    }
}

impl Error for ConfigurationError {}

#[derive(Debug, Clone, Copy)]
pub(crate) enum UsageErrorKind {
    Disposed,
    RunningCycle,
    NoCallablesRegistered,
    DoubleDispose,
}

/// Returned when `add`, `execute_and_wait[_async]`, or `dispose` are
/// called in a state that forbids them.
#[derive(Debug)]
pub struct UsageError {
    kind: UsageErrorKind,
}

impl UsageError {
    pub(crate) fn new(kind: UsageErrorKind) -> Self {
        UsageError { kind }
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self.kind {
            UsageErrorKind::Disposed => "dispatcher has already been disposed",
            UsageErrorKind::RunningCycle => {
                "operation is not allowed while a cycle is running"
            }
            UsageErrorKind::NoCallablesRegistered => {
                "cannot trigger a cycle with no callables registered"
            }
            UsageErrorKind::DoubleDispose => "dispose has already been called",
        };
        f.write_str(message)
    }
}

impl Error for UsageError {}

/// A single callable's panic, caught and recorded rather than propagated
/// into the worker that ran it.
#[derive(Debug, Clone)]
pub struct CallableFailure {
    message: String,
    node_index: usize,
}

impl CallableFailure {
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send), node_index: usize) -> Self {
        CallableFailure {
            message: crate::unwind::payload_message(payload),
            node_index,
        }
    }

    /// The panic message, or a placeholder if the payload was not a string.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The registration-order index of the callable that failed.
    ///
    /// This identifies *which* callable failed for diagnostics only;
    /// execution order is never guaranteed to follow registration order.
    pub fn node_index(&self) -> usize {
        self.node_index
    }
}

impl fmt::Display for CallableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callable #{} failed: {}", self.node_index, self.message)
    }
}

impl Error for CallableFailure {}

/// One or more [`CallableFailure`]s surfaced together at the end of a
/// cycle. Every individual failure is preserved; none are dropped,
/// deduplicated, or summarised away.
#[derive(Debug, Clone)]
pub struct AggregatedCallableFailure {
    failures: Vec<CallableFailure>,
}

impl AggregatedCallableFailure {
    pub(crate) fn new(failures: Vec<CallableFailure>) -> Self {
        debug_assert!(!failures.is_empty());
        AggregatedCallableFailure { failures }
    }

    /// All individual failures that occurred during the cycle, in the
    /// order they were recorded (not necessarily execution order).
    pub fn failures(&self) -> &[CallableFailure] {
        &self.failures
    }
}

impl fmt::Display for AggregatedCallableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} callable(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
        }
        Ok(())
    }
}

impl Error for AggregatedCallableFailure {}

/// Either kind of failure `execute_and_wait`/`execute_and_wait_async` can
/// report: a usage error (the cycle never ran at all) or one or more
/// callables panicking during a cycle that did run.
#[derive(Debug)]
pub enum ExecuteError {
    Usage(UsageError),
    Failed(AggregatedCallableFailure),
}

impl From<UsageError> for ExecuteError {
    fn from(err: UsageError) -> Self {
        ExecuteError::Usage(err)
    }
}

impl From<AggregatedCallableFailure> for ExecuteError {
    fn from(err: AggregatedCallableFailure) -> Self {
        ExecuteError::Failed(err)
    }
}

impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::Usage(err) => write!(f, "{err}"),
            ExecuteError::Failed(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ExecuteError {}
