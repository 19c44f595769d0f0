//! Error types for unison
//!
//! Provides a unified error type used across all unison crates.

use std::path::PathBuf;

/// Main error type for unison operations
#[derive(Debug, thiserror::Error)]
pub enum UnisonError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Instance-state block errors ===

    #[error("Failed to create instance block {path}: {source}")]
    BlockCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to attach to instance block {path}: {source}")]
    BlockAttach {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to lock instance block: {0}")]
    BlockLock(std::io::Error),

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Primary not listening at {path}")]
    PrimaryNotRunning { path: PathBuf },

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    // === Protocol Errors ===

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Endpoint Errors ===

    #[error("Failed to set up channel endpoint {path}: {source}")]
    Endpoint {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UnisonError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error ends the election (the process cannot determine
    /// uniqueness without the block)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BlockCreate { .. } | Self::BlockAttach { .. } | Self::BlockLock(_)
        )
    }
}

/// Result type alias using UnisonError
pub type Result<T> = std::result::Result<T, UnisonError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Display Tests ====================

    #[test]
    fn test_error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = UnisonError::Io(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_display_block_create() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = UnisonError::BlockCreate {
            path: PathBuf::from("/tmp/unison/abc.block"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to create instance block"));
        assert!(msg.contains("/tmp/unison/abc.block"));
    }

    #[test]
    fn test_error_display_block_attach() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = UnisonError::BlockAttach {
            path: PathBuf::from("/tmp/unison/abc.block"),
            source: io_err,
        };
        assert!(err.to_string().contains("Failed to attach"));
    }

    #[test]
    fn test_error_display_connection() {
        let err = UnisonError::Connection("refused".into());
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_error_display_primary_not_running() {
        let err = UnisonError::PrimaryNotRunning {
            path: PathBuf::from("/tmp/unison/abc.sock"),
        };
        let msg = err.to_string();
        assert!(msg.contains("Primary not listening"));
        assert!(msg.contains("/tmp/unison/abc.sock"));
    }

    #[test]
    fn test_error_display_connection_closed() {
        let err = UnisonError::ConnectionClosed;
        assert_eq!(err.to_string(), "Connection closed unexpectedly");
    }

    #[test]
    fn test_error_display_protocol() {
        let err = UnisonError::Protocol("bad handshake".into());
        assert_eq!(err.to_string(), "Protocol error: bad handshake");
    }

    // ==================== Helper Tests ====================

    #[test]
    fn test_helper_constructors() {
        assert!(matches!(
            UnisonError::connection("x"),
            UnisonError::Connection(_)
        ));
        assert!(matches!(UnisonError::protocol("x"), UnisonError::Protocol(_)));
        assert!(matches!(UnisonError::config("x"), UnisonError::Config(_)));
        assert!(matches!(UnisonError::internal("x"), UnisonError::Internal(_)));
    }

    #[test]
    fn test_fatal_classification() {
        let io = || std::io::Error::new(std::io::ErrorKind::Other, "x");
        assert!(UnisonError::BlockCreate {
            path: PathBuf::new(),
            source: io()
        }
        .is_fatal());
        assert!(UnisonError::BlockAttach {
            path: PathBuf::new(),
            source: io()
        }
        .is_fatal());
        assert!(UnisonError::BlockLock(io()).is_fatal());
        assert!(!UnisonError::ConnectionClosed.is_fatal());
        assert!(!UnisonError::connection("timeout").is_fatal());
    }
}
