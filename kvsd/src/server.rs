//! Server context: the shared machinery every handler operates on.
//!
//! The context is built once by the parent before any listener starts;
//! forked client handlers, observers and the snapshot worker inherit it.
//! Only the mappings, the semaphore set and the queue are shared between
//! processes — the rest of the struct is per-process state after `fork`.

use crate::command::CommandTable;
use crate::error::ServerResult;
use crate::newsletter::Newsletter;
use crate::{exec, lock, net, newsletter, storage};
use kvsd_common::ServerConfig;
use kvsd_shared_memory::{OffsetMap, SharedHeap, StorageGate};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{error, info};

/// Distinguishes contexts built in one process (tests build several).
static INSTANCE: AtomicU32 = AtomicU32::new(0);

/// Process-initialized context passed to every command handler.
pub struct Server {
    /// Validated configuration.
    pub config: ServerConfig,
    /// The shared heap holding all cross-process data.
    pub heap: SharedHeap,
    /// Reader/writer gate guarding the heap residents.
    pub gate: StorageGate,
    /// key → value map of the storage engine.
    pub records: OffsetMap,
    /// Pub/sub module; `None` when disabled.
    pub newsletter: Option<Newsletter>,
}

impl Server {
    /// Build the shared machinery for `config`.
    pub fn initialize(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;

        // Segment names carry the parent pid so stale files from a
        // crashed instance never collide with a fresh one.
        let namespace = format!(
            "{}-{}",
            std::process::id(),
            INSTANCE.fetch_add(1, Ordering::Relaxed)
        );

        let mut heap = SharedHeap::create(&namespace, config.initial_storage_bytes)?;
        let gate = StorageGate::create(&namespace)?;
        let records = OffsetMap::create(&mut heap, config.initial_storage_entries, true)?;

        let newsletter = if config.enable_newsletter {
            Some(Newsletter::create(&namespace, &mut heap)?)
        } else {
            None
        };

        let mut server = Self {
            config,
            heap,
            gate,
            records,
            newsletter,
        };
        storage::load_snapshot(&mut server)?;

        Ok(server)
    }

    /// Build the command table in protocol order.
    pub fn build_command_table(config: &ServerConfig) -> ServerResult<CommandTable> {
        let mut table = CommandTable::new();
        storage::register(&mut table)?;
        lock::register(&mut table)?;
        if config.enable_newsletter {
            newsletter::register(&mut table)?;
        }
        if config.enable_exec {
            exec::register(&mut table)?;
        }
        net::register(&mut table)?;
        // Aggregates come last so the canonical overview is unchanged.
        storage::register_aggregates(&mut table)?;
        Ok(table)
    }

    /// Final snapshot and removal of every shared object (parent only).
    pub fn teardown(mut self) {
        if let Err(e) = storage::save_snapshot(&mut self) {
            error!("final snapshot failed: {e}");
        }
        if let Some(newsletter) = self.newsletter.take() {
            newsletter.destroy();
        }
        self.gate.destroy();
        self.heap.destroy();
        info!("server teardown complete");
    }
}
