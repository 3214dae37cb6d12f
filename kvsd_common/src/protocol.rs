//! Wire-level response vocabulary of the line command protocol.
//!
//! Every string a handler may place into a command's response message is
//! defined here, so the dispatcher, the adapters and the tests agree on
//! one spelling.

/// Line terminator of every protocol response.
pub const CRLF: &str = "\r\n";

/// Prefix of the unknown-command overview line.
pub const SUPPORTED_COMMANDS: &str = "SUPPORTED_COMMANDS: ";

/// Reply to a line exceeding the receive buffer.
pub const BUFFER_EXCEEDED: &str = "BUFFER_EXCEEDED";

/// Lookup or deletion target does not exist.
pub const KEY_NONEXISTENT: &str = "key_nonexistent";
/// PUT created a new record.
pub const RECORD_NEW: &str = "record_new";
/// PUT replaced an existing record.
pub const RECORD_OVERWRITTEN: &str = "record_overwritten";
/// The shared heap could not be grown to hold the record.
pub const STORAGE_FULL: &str = "storage_full";
/// Per-record response value of a successful DEL.
pub const KEY_DELETED: &str = "key_deleted";

/// Fewer arguments than the command requires.
pub const ARGUMENT_MISSING: &str = "argument_missing";
/// Key or value contains a character outside the permitted set.
pub const ARGUMENT_BAD_SYMBOL: &str = "argument_bad_symbol";
/// Key or value exceeds its length limit.
pub const ARGUMENT_TOO_LONG: &str = "argument_too_long";

/// SUB succeeded.
pub const SUBSCRIBED: &str = "subscribed";
/// SUB on a key this client already observes.
pub const ALREADY_SUBSCRIBED: &str = "already_subscribed";
/// All subscriber IDs are taken.
pub const SUBSCRIBERS_FULL: &str = "subscribers_full";

/// BEG acquired exclusive mode.
pub const LOCKED: &str = "locked";
/// BEG while this client is already exclusive.
pub const ALREADY_LOCKED: &str = "already_locked";
/// END released exclusive mode.
pub const UNLOCKED: &str = "unlocked";
/// END without holding exclusive mode.
pub const NOT_LOCKED: &str = "not_locked";

/// OP child exited with status 0.
pub const OP_SUCCESSFUL: &str = "op_successful";
/// OP child failed to run or exited non-zero.
pub const OP_FAILED: &str = "op_failed";

/// QUIT farewell.
pub const GOODBYE: &str = "goodbye";
