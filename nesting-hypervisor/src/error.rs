//! Error types for the hypervisor abstraction layer.

use thiserror::Error;

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// A pool ran out of free entries. Never waited on; the caller may retry.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// VM was not found.
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// The caller abandoned the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The caller's deadline passed before the operation finished.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// A VM never reported an address within the allowed time.
    #[error("Timed out after {timeout_secs}s waiting for address of {mac}")]
    AddressTimeout { mac: String, timeout_secs: u64 },

    /// Failed to create a VM.
    #[error("Failed to create VM: {0}")]
    CreateFailed(String),

    /// Failed to delete a VM.
    #[error("Failed to delete VM: {0}")]
    DeleteFailed(String),

    /// Query failed.
    #[error("Failed to query: {0}")]
    QueryFailed(String),

    /// An external control command failed.
    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

impl HypervisorError {
    /// True for the two conditions raised by the caller's [`Context`](crate::Context)
    /// rather than by the backend.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HypervisorError::Cancelled | HypervisorError::DeadlineExceeded)
    }

    /// Re-wrap a driver failure with operation context.
    ///
    /// Cancellation, pool exhaustion and unknown-VM errors pass through
    /// untouched so callers can still tell them apart.
    pub fn wrap_with<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> HypervisorError,
    {
        match self {
            HypervisorError::Cancelled
            | HypervisorError::DeadlineExceeded
            | HypervisorError::ResourceExhausted(_)
            | HypervisorError::VmNotFound(_) => self,
            other => f(other.to_string()),
        }
    }
}
