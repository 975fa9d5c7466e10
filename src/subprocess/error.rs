use crate::error::LoopError;
use std::time::Duration;

/// Failure to run a command at all; a non-zero exit is reported through
/// [`ExitStatus`](super::ExitStatus) instead
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("no scripted answer: {0}")]
    MockExpectationNotMet(String),
}

impl ProcessError {
    /// Attach the backend that issued the command
    pub fn into_backend_error(self, backend: &'static str, context: impl Into<String>) -> LoopError {
        LoopError::backend_with_source(backend, context, self)
    }
}
