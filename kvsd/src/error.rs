//! Server-level error type.

use kvsd_common::ConfigError;
use kvsd_shared_memory::ShmError;
use thiserror::Error;

/// Errors that can occur while running the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration rejected.
    #[error("Configuration error: {source}")]
    Config {
        /// Source validation error
        #[from]
        source: ConfigError,
    },

    /// Shared memory machinery failed.
    #[error("Shared memory error: {source}")]
    Shm {
        /// Source shared memory error
        #[from]
        source: ShmError,
    },

    /// Command table misuse (duplicate name, bad arity).
    #[error("Command registration error: {0}")]
    Registration(String),

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
