use std::time::Duration;

use fathom_common::FathomError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunerError>;

/// Failure reported by an execution environment for a single call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution fault: {0}")]
    Fault(String),
}

#[derive(Debug, Error)]
pub enum TunerError {
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("Execution timed out after {timeout:?}")]
    ExecutionTimeout { timeout: Duration },

    #[error("Execution fault: {0}")]
    ExecutionFault(String),

    #[error("Training run cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] FathomError),
}

impl From<ExecutionError> for TunerError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Timeout(timeout) => TunerError::ExecutionTimeout { timeout },
            ExecutionError::Fault(message) => TunerError::ExecutionFault(message),
        }
    }
}
