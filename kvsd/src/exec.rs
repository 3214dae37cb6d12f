//! OP command: pipe a record through an external shell program.
//!
//! `OP key program` feeds the key's current value (empty when absent)
//! into `/bin/sh -c program`, captures stdout and stores the trimmed
//! output back under the key. Reads and writes go through the regular
//! storage primitives, so subscribers see the resulting PUT. Concurrent
//! OPs on the same key race by design.

use crate::command::{Command, CommandTable};
use crate::error::ServerResult;
use crate::server::Server;
use crate::storage;
use kvsd_common::consts::VALUE_MAX_LEN;
use kvsd_common::protocol;
use std::io::Write;
use std::process::{Command as ShellCommand, Stdio};
use tracing::{debug, error};

/// Register the OP command.
pub fn register(table: &mut CommandTable) -> ServerResult<()> {
    table.register("OP", 2, false, cmd_op)
}

fn cmd_op(server: &mut Server, cmd: &mut Command) -> bool {
    match op_flow(server, &cmd.key, &cmd.value) {
        Ok(success) => {
            cmd.response_message = if success {
                protocol::OP_SUCCESSFUL.to_string()
            } else {
                protocol::OP_FAILED.to_string()
            };
            true
        }
        Err(e) => {
            error!("OP failed: {e}");
            cmd.response_message = protocol::OP_FAILED.to_string();
            false
        }
    }
}

fn op_flow(server: &mut Server, key: &str, program: &str) -> ServerResult<bool> {
    let input = storage::get_record(server, key)?.unwrap_or_default();

    let mut child = ShellCommand::new("/bin/sh")
        .arg("-c")
        .arg(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        // A program that never reads its input is fine; ignore EPIPE.
        if let Err(e) = stdin.write_all(&input) {
            debug!("op input not consumed: {e}");
        }
    }

    let output = child.wait_with_output()?;

    let stdout = &output.stdout;
    let end = stdout
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    let start = stdout[..end]
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(end);
    let result = &stdout[start..end.min(start + VALUE_MAX_LEN)];

    if !result.is_empty() {
        storage::put_record(server, key, result)?;
    }

    Ok(output.status.success())
}
