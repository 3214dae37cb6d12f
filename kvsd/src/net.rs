//! TCP line protocol: accept/fork loop and the per-client handler.
//!
//! Every accepted connection gets its own forked process; the handler
//! reassembles input into terminated lines, runs each through the
//! dispatcher and writes the formatted response back. A line exceeding
//! the receive buffer answers `BUFFER_EXCEEDED` and is discarded through
//! the next terminator, leaving the connection open.

use crate::command::{self, Command, CommandTable};
use crate::error::ServerResult;
use crate::process;
use crate::server::Server;
use kvsd_common::consts::RECV_BUFFER_SIZE;
use kvsd_common::protocol;
use nix::unistd::{ForkResult, fork};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use tracing::{error, info, warn};

/// Register the QUIT command.
pub fn register(table: &mut CommandTable) -> ServerResult<()> {
    table.register("QUIT", 0, false, cmd_quit)
}

fn cmd_quit(_server: &mut Server, cmd: &mut Command) -> bool {
    cmd.response_message = protocol::GOODBYE.to_string();
    true
}

/// Per-connection entry point run in the forked child.
pub type ClientHandler = fn(&mut Server, &CommandTable, TcpStream);

/// Accept connections on `listener`, forking `handler` per client.
///
/// Runs until a shutdown signal interrupts `accept`. The `title` names
/// the forked children (`kvsd(<title>)`).
pub fn accept_loop(
    server: &mut Server,
    table: &CommandTable,
    listener: TcpListener,
    title: &str,
    handler: ClientHandler,
) -> ServerResult<()> {
    loop {
        if process::shutdown_requested() {
            break;
        }
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };

        match unsafe { fork() } {
            Err(e) => {
                error!("fork failed: {e}");
                drop(stream);
            }
            Ok(ForkResult::Child) => {
                // The listening socket belongs to the parent.
                unsafe { libc::close(listener.as_raw_fd()) };
                process::reset_child_signals();
                process::set_title(&format!("kvsd({title})"));
                process::die_with_parent();

                info!(pid = std::process::id(), %peer, "client connected");
                handler(server, table, stream);
                info!(pid = std::process::id(), %peer, "client disconnected");
                std::process::exit(0);
            }
            Ok(ForkResult::Parent { .. }) => drop(stream),
        }
    }
    Ok(())
}

/// Bind the command port and serve line-protocol clients.
pub fn run_command_server(server: &mut Server, table: &CommandTable) -> ServerResult<()> {
    let port = server.config.command_port;
    let listener = bind(port)?;
    info!(port, "command server listening");
    accept_loop(server, table, listener, "cmd-cli", handle_client)
}

/// Bind a listener on all interfaces.
pub(crate) fn bind(port: u16) -> ServerResult<TcpListener> {
    Ok(TcpListener::bind(("0.0.0.0", port))?)
}

/// Line-protocol client loop: reassemble, dispatch, respond.
pub fn handle_client(server: &mut Server, table: &CommandTable, mut stream: TcpStream) {
    if let Some(newsletter) = server.newsletter.as_mut() {
        match stream.try_clone() {
            Ok(clone) => newsletter.client_socket = Some(clone),
            Err(e) => warn!("socket clone for notifications failed: {e}"),
        }
    }

    let mut cmd = Command::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut discarding = false;
    let mut chunk = [0u8; 512];

    'connection: loop {
        let read = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("recv failed: {e}");
                break;
            }
        };
        pending.extend_from_slice(&chunk[..read]);

        loop {
            if discarding {
                match pending.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        pending.drain(..=pos);
                        discarding = false;
                    }
                    None => {
                        pending.clear();
                        continue 'connection;
                    }
                }
            }

            let Some(pos) = pending.iter().position(|&b| b == b'\n') else {
                if pending.len() > RECV_BUFFER_SIZE {
                    send_buffer_exceeded(&mut stream);
                    pending.clear();
                    discarding = true;
                }
                continue 'connection;
            };

            if pos + 1 > RECV_BUFFER_SIZE {
                send_buffer_exceeded(&mut stream);
                pending.drain(..=pos);
                continue;
            }

            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);

            command::parse_input(table, &mut cmd, &line);
            command::execute(table, server, &mut cmd);
            let response = command::format_response(table, &cmd);

            if let Err(e) = stream.write_all(response.as_bytes()) {
                warn!("send failed: {e}");
                break 'connection;
            }
            if cmd.name == "QUIT" {
                break 'connection;
            }
        }
    }
}

fn send_buffer_exceeded(stream: &mut TcpStream) {
    let line = format!("{}{}", protocol::BUFFER_EXCEEDED, protocol::CRLF);
    if let Err(e) = stream.write_all(line.as_bytes()) {
        warn!("send failed: {e}");
    }
}
