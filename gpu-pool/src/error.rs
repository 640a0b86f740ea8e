//! Pool error types.

use std::fmt;

/// Errors that can occur in the GPU pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The backend refused to create a resource.
    ResourceCreationFailed(String),
    /// Out of GPU memory.
    OutOfMemory,
    /// The GPU device was lost.
    DeviceLost,
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// A handle refers to an arena that was reset or torn down.
    StaleHandle(String),
    /// An internal error occurred.
    Internal(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::StaleHandle(msg) => write!(f, "stale handle: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Result alias used across the pools.
pub type PoolResult<T> = Result<T, PoolError>;
