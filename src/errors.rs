use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LabError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient funds in account {account}: balance {balance:.2}, requested {requested:.2}")]
    InsufficientFunds {
        account: u64,
        balance: f64,
        requested: f64,
    },

    #[error("could not serialize access due to concurrent update on {0}")]
    SerializationFailure(String),

    #[error("deadlock detected: lock wait on {0} timed out")]
    Deadlock(String),

    #[error("timeout: operation exceeded {0:?}")]
    Timeout(Duration),

    #[error("timeout: operation cancelled at simulation deadline")]
    Cancelled,

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Arrow manipulation error: {0}")]
    ArrowError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl LabError {
    /// Collaborator-level failures that must surface to the caller instead of
    /// being folded into an operation outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LabError::StorageUnavailable(_))
    }

    /// Outcomes attributable to concurrent access conflict.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            LabError::SerializationFailure(_) | LabError::Deadlock(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LabError::Timeout(_) | LabError::Cancelled)
    }
}

impl From<arrow::error::ArrowError> for LabError {
    fn from(e: arrow::error::ArrowError) -> Self {
        LabError::ArrowError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LabError>;
