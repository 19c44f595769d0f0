//! unison-utils: Common utilities shared across unison crates
//!
//! This crate provides:
//! - Unified error types ([`UnisonError`], [`Result`])
//! - Logging infrastructure ([`init_logging`], [`LogConfig`])
//! - Endpoint path utilities ([`paths`] module)
//! - OS username lookup ([`username`])

pub mod error;
pub mod logging;
pub mod paths;
pub mod username;

// Re-export main types at crate root for convenience
pub use error::{Result, UnisonError};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};
pub use username::username;

// Re-export commonly used path functions
pub use paths::{block_path, endpoint_dir, ensure_dir, log_dir, socket_path};
