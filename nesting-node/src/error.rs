//! Error types for the request handler and the client.

use std::path::PathBuf;

use thiserror::Error;

use nesting_hypervisor::HypervisorError;
use nesting_proto::{ErrorCode, FrameError};

/// Errors returned by [`NestingService`](crate::NestingService).
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("service is already initialized")]
    AlreadyInitialized,

    #[error("service is not initialized")]
    NotInitialized,

    /// Deleting the previous occupant of a slot failed; the slot still
    /// belongs to it.
    #[error("deleting vm {id} occupying slot {slot}: {source}")]
    StompFailed {
        slot: i32,
        id: String,
        #[source]
        source: HypervisorError,
    },

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::AlreadyInitialized => ErrorCode::AlreadyInitialized,
            ServiceError::NotInitialized => ErrorCode::NotInitialized,
            ServiceError::StompFailed { source, .. } => hypervisor_code(source),
            ServiceError::Hypervisor(e) => hypervisor_code(e),
            ServiceError::Internal(_) => ErrorCode::Driver,
        }
    }
}

fn hypervisor_code(e: &HypervisorError) -> ErrorCode {
    match e {
        HypervisorError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
        HypervisorError::VmNotFound(_) => ErrorCode::NotFound,
        HypervisorError::Cancelled => ErrorCode::Cancelled,
        HypervisorError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
        _ => ErrorCode::Driver,
    }
}

/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors returned by [`Client`](crate::Client).
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connecting to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("server closed the connection without replying")]
    Closed,

    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    /// The server handled the call and reported an error.
    #[error("{message} ({})", code.as_str())]
    Status { code: ErrorCode, message: String },
}

impl ClientError {
    /// The server-side error code, if the server answered with one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ServiceError::NotInitialized.code(), ErrorCode::NotInitialized);
        assert_eq!(
            ServiceError::from(HypervisorError::VmNotFound("x".to_string())).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            ServiceError::from(HypervisorError::CreateFailed("boom".to_string())).code(),
            ErrorCode::Driver
        );

        let stomp = ServiceError::StompFailed {
            slot: 0,
            id: "nesting-aaaaaaaa".to_string(),
            source: HypervisorError::DeadlineExceeded,
        };
        assert_eq!(stomp.code(), ErrorCode::DeadlineExceeded);
        assert!(stomp.to_string().contains("nesting-aaaaaaaa"));
    }
}
