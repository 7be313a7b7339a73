use core::fmt;
use std::time::Duration;

use thiserror::Error;

/// Conditions a stack operation cannot resolve by retrying.
///
/// Losing a CAS race is not among them: that is retried internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    /// No element was linked when the head was observed.
    #[error("pop from an empty stack")]
    EmptyStack,

    #[error("failed to allocate a stack node of {size} bytes")]
    AllocationFailure { size: usize },

    /// The backoff wait was interrupted. The [`Interrupt`](crate::Interrupt)
    /// stays set.
    #[error("backoff wait was interrupted")]
    InterruptedWait,
}

/// A push that did not happen, handing the value back.
pub struct PushError<V> {
    pub value: V,
    pub error: StackError,
}

impl<V> PushError<V> {
    pub(crate) fn new(value: V, error: StackError) -> Self {
        PushError { value, error }
    }

    pub fn into_inner(self) -> V {
        self.value
    }
}

impl<V> fmt::Debug for PushError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<V> fmt::Display for PushError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "push failed: {}", self.error)
    }
}

impl<V> std::error::Error for PushError<V> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Rejected backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("minimum backoff delay must be non-zero")]
    ZeroMinDelay,

    #[error("minimum backoff delay {min:?} exceeds maximum {max:?}")]
    MinExceedsMax { min: Duration, max: Duration },

    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}
