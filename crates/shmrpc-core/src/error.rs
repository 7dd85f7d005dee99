//! Error types for shmrpc.
//!
//! Lock failures, channel failures, transport-level retry exhaustion and
//! method-level (remote) failures are separate variants so callers can retry
//! differently for each: reconnect, give up, or surface to the application.

use crate::endpoint::RemoteError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the shmrpc library.
#[derive(Debug, Error)]
pub enum ShmRpcError {
    // Lock errors
    #[error("Timed out after {timeout:?} waiting for lock {name}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("Lock {name} has been destroyed")]
    LockDestroyed { name: String },

    #[error("No such lock: {name}")]
    NoSuchLock { name: String },

    #[error("Lock already exists: {name}")]
    LockExists { name: String },

    // Channel errors
    #[error("No such shared memory segment: {name}")]
    NoSuchChannel { name: String },

    #[error("Shared memory segment already exists: {name}")]
    ChannelExists { name: String },

    #[error("Resize of {name} did not grow the segment ({old} -> {new} bytes)")]
    ResizeDidNotGrow { name: String, old: usize, new: usize },

    // Transport errors
    #[error("Request on connection ({pid}, {qid}) was not picked up after {attempts} resends")]
    Resend { pid: u32, qid: u64, attempts: u32 },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Serialization errors
    #[error("{codec} codec error: {message}")]
    Codec { codec: &'static str, message: String },

    #[error("Method {method} uses the insecure {codec} codec; enable insecure codecs explicitly")]
    InsecureCodec { method: String, codec: &'static str },

    // Dispatch errors
    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Method registered twice: {method}")]
    DuplicateMethod { method: String },

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    // Registry errors
    #[error("Registry error: {message}")]
    Registry { message: String },

    // System errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{op} failed: {message}")]
    Os { op: &'static str, message: String },

    // Configuration errors
    #[error("Invalid configuration for {field}: {message}")]
    Config { field: String, message: String },

    #[error("Worker {pid} failed to start: {message}")]
    WorkerStart { pid: u32, message: String },

    #[error("Context created by process {expected} used from forked process {actual}")]
    ForkedProcess { expected: u32, actual: u32 },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for shmrpc operations.
pub type Result<T> = std::result::Result<T, ShmRpcError>;

impl From<std::io::Error> for ShmRpcError {
    fn from(err: std::io::Error) -> Self {
        ShmRpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ShmRpcError {
    fn from(err: serde_json::Error) -> Self {
        ShmRpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for ShmRpcError {
    fn from(err: nix::errno::Errno) -> Self {
        ShmRpcError::Os {
            op: "system call",
            message: err.desc().to_string(),
        }
    }
}

impl From<RemoteError> for ShmRpcError {
    fn from(err: RemoteError) -> Self {
        ShmRpcError::Remote(err)
    }
}

impl ShmRpcError {
    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        ShmRpcError::Protocol {
            message: message.into(),
        }
    }

    /// Create an OS error for a named operation.
    pub fn os(op: &'static str, message: impl std::fmt::Display) -> Self {
        ShmRpcError::Os {
            op,
            message: message.to_string(),
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShmRpcError::LockTimeout { .. })
    }

    /// True when the peer tore the connection down (or never set it up).
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ShmRpcError::LockDestroyed { .. }
                | ShmRpcError::NoSuchLock { .. }
                | ShmRpcError::NoSuchChannel { .. }
        )
    }

    /// The remote error, if this is a method-level failure.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            ShmRpcError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShmRpcError::NoSuchLock {
            name: "client_9000_pid_1_0".into(),
        };
        assert_eq!(err.to_string(), "No such lock: client_9000_pid_1_0");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ShmRpcError::LockTimeout {
            name: "x".into(),
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!ShmRpcError::LockDestroyed { name: "x".into() }.is_retryable());
    }

    #[test]
    fn test_connection_lost_errors() {
        assert!(ShmRpcError::LockDestroyed { name: "x".into() }.is_connection_lost());
        assert!(ShmRpcError::NoSuchChannel { name: "x".into() }.is_connection_lost());
        assert!(!ShmRpcError::Resend {
            pid: 1,
            qid: 0,
            attempts: 3
        }
        .is_connection_lost());
    }

    #[test]
    fn test_remote_error_is_distinct() {
        let err: ShmRpcError = RemoteError::parse("KeyError: 'missing'").into();
        assert_eq!(err.as_remote().map(|e| e.message.as_str()), Some("'missing'"));
        assert!(!err.is_connection_lost());
    }
}
