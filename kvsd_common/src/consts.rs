//! System-wide constants for the kvsd workspace.
//!
//! Single source of truth for all numeric limits and default paths.
//! Imported by all crates — no duplication permitted.

/// Maximum stored key length in bytes.
pub const KEY_MAX_LEN: usize = 64;

/// Maximum stored value length in bytes.
pub const VALUE_MAX_LEN: usize = 256;

/// Maximum number of concurrent subscribers (bits of the registry word).
pub const MAX_SUBSCRIBERS: usize = 64;

/// Receive buffer size for one protocol line, terminator included.
pub const RECV_BUFFER_SIZE: usize = 1024;

/// Default TCP port of the line command protocol.
pub const DEFAULT_COMMAND_PORT: u16 = 5678;

/// Default TCP port of the HTTP adapter.
pub const DEFAULT_HTTP_PORT: u16 = 5680;

/// Default snapshot interval [s]. 0 disables the snapshot worker.
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 60;

/// Default number of records the storage map is sized for at startup.
pub const DEFAULT_STORAGE_ENTRIES: usize = 1024;

/// Default initial shared-heap capacity in bytes.
pub const DEFAULT_STORAGE_BYTES: usize = 1024 * 1024;

/// Default snapshot file path.
pub const DEFAULT_STORAGE_FILE: &str = "data.csv";

/// Default web root served by the HTTP adapter.
pub const DEFAULT_WEB_ROOT: &str = "./web";
