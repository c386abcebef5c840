//! Typed errors at the Stratum protocol boundary: a closed set of
//! variants, each carrying the JSON-RPC error code and message the wire
//! protocol expects.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("Duplicate share")]
    DuplicateShare,
    #[error("Block expired")]
    StaleShare,
    #[error("Invalid share")]
    InvalidShare,
    #[error("Low difficulty share")]
    LowDifficulty,
    #[error("Invalid address used for login")]
    InvalidAddress,
    #[error("Malformed request")]
    MalformedRequest,
    #[error("Job not found")]
    JobNotFound,
    #[error("Internal error")]
    Internal,
}

impl PoolError {
    /// JSON-RPC error code used on the wire.
    pub fn code(&self) -> i32 {
        match self {
            PoolError::DuplicateShare => -1,
            PoolError::StaleShare => -1,
            PoolError::InvalidShare => -1,
            PoolError::LowDifficulty => -1,
            PoolError::InvalidAddress => -1,
            PoolError::MalformedRequest => -1,
            PoolError::JobNotFound => -1,
            PoolError::Internal => -32603,
        }
    }
}
