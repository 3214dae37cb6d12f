//! kvsd server binary: CLI parsing, wiring and the main accept loop.

use clap::Parser;
use kvsd::{Server, ServerResult, http, net, process, storage};
use kvsd_common::ServerConfig;
use kvsd_common::consts::{
    DEFAULT_COMMAND_PORT, DEFAULT_HTTP_PORT, DEFAULT_SNAPSHOT_INTERVAL_SECS,
    DEFAULT_STORAGE_BYTES, DEFAULT_STORAGE_ENTRIES, DEFAULT_STORAGE_FILE, DEFAULT_WEB_ROOT,
};
use nix::unistd::{ForkResult, fork};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Shared-memory key-value server.
#[derive(Parser, Debug)]
#[command(name = "kvsd", version, about)]
struct Cli {
    /// TCP port of the line command protocol.
    #[arg(long, default_value_t = DEFAULT_COMMAND_PORT)]
    port: u16,

    /// TCP port of the HTTP adapter.
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT)]
    http_port: u16,

    /// Disable the HTTP adapter.
    #[arg(long)]
    no_http: bool,

    /// Disable the pub/sub newsletter (SUB command).
    #[arg(long)]
    no_newsletter: bool,

    /// Disable the OP external program executor.
    #[arg(long)]
    no_exec: bool,

    /// Snapshot interval in seconds (0 disables periodic snapshots).
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_INTERVAL_SECS)]
    snapshot_interval: u64,

    /// Number of records the storage map is sized for at startup.
    #[arg(long, default_value_t = DEFAULT_STORAGE_ENTRIES)]
    storage_entries: usize,

    /// Initial shared-heap capacity in bytes.
    #[arg(long, default_value_t = DEFAULT_STORAGE_BYTES)]
    storage_bytes: usize,

    /// Directory served by the HTTP adapter outside /storage/.
    #[arg(long, default_value = DEFAULT_WEB_ROOT)]
    web_root: PathBuf,

    /// CSV snapshot file.
    #[arg(long, default_value = DEFAULT_STORAGE_FILE)]
    storage_file: PathBuf,

    /// Log level filter (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            command_port: self.port,
            http_port: self.http_port,
            enable_http: !self.no_http,
            enable_newsletter: !self.no_newsletter,
            enable_exec: !self.no_exec,
            snapshot_interval_secs: self.snapshot_interval,
            initial_storage_entries: self.storage_entries,
            initial_storage_bytes: self.storage_bytes,
            web_root: self.web_root,
            storage_file: self.storage_file,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli.into_config()) {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

fn run(config: ServerConfig) -> ServerResult<()> {
    // The reattach broadcast targets our own process group.
    process::become_group_leader();
    process::install_shutdown_handlers();
    process::ignore_children();

    let table = Server::build_command_table(&config)?;
    let mut server = Server::initialize(config)?;

    storage::spawn_snapshot_worker(&mut server)?;

    if server.config.enable_http {
        match unsafe { fork() }? {
            ForkResult::Child => {
                process::reset_child_signals();
                process::set_title("kvsd(http)");
                process::die_with_parent();
                if let Err(e) = http::run_http_server(&mut server, &table) {
                    error!("http server failed: {e}");
                }
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                info!(pid = child.as_raw(), "http server started");
            }
        }
    }

    let result = net::run_command_server(&mut server, &table);

    info!("shutting down");
    server.teardown();
    result
}
