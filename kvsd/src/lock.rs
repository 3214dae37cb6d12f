//! Exclusive-mode commands.
//!
//! `BEG` write-acquires the storage gate for this client until `END`;
//! in between, the client's own read/write sections are no-ops while
//! every other client blocks on the gate.

use crate::command::{Command, CommandTable};
use crate::error::ServerResult;
use crate::server::Server;
use kvsd_common::protocol;
use tracing::error;

/// Register the lock commands.
pub fn register(table: &mut CommandTable) -> ServerResult<()> {
    table.register("BEG", 0, false, cmd_begin)?;
    table.register("END", 0, false, cmd_end)?;
    Ok(())
}

fn cmd_begin(server: &mut Server, cmd: &mut Command) -> bool {
    match server.gate.begin_exclusive() {
        Ok(true) => {
            cmd.response_message = protocol::LOCKED.to_string();
            true
        }
        Ok(false) => {
            cmd.response_message = protocol::ALREADY_LOCKED.to_string();
            true
        }
        Err(e) => {
            error!("BEG failed: {e}");
            false
        }
    }
}

fn cmd_end(server: &mut Server, cmd: &mut Command) -> bool {
    match server.gate.end_exclusive() {
        Ok(true) => {
            cmd.response_message = protocol::UNLOCKED.to_string();
            true
        }
        Ok(false) => {
            cmd.response_message = protocol::NOT_LOCKED.to_string();
            true
        }
        Err(e) => {
            error!("END failed: {e}");
            false
        }
    }
}
