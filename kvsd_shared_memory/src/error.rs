//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment already exists
    #[error("Segment already exists: {name}")]
    AlreadyExists {
        /// Segment name
        name: String,
    },

    /// Segment not found
    #[error("Segment not found: {name}")]
    NotFound {
        /// Segment name
        name: String,
    },

    /// Invalid segment size
    #[error("Invalid segment size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Segment header failed validation
    #[error("Segment corrupted: {name}")]
    Corrupted {
        /// Segment name
        name: String,
    },

    /// The heap could not satisfy an allocation even after growth
    #[error("Shared heap exhausted: {requested} bytes requested")]
    Exhausted {
        /// Rounded block size that could not be placed
        requested: usize,
    },

    /// A SysV IPC object could not be created or operated on
    #[error("IPC failure in {call}: {errno}")]
    Ipc {
        /// Failing system call
        call: &'static str,
        /// Reported errno
        errno: nix::Error,
    },

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

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
