//! Storage engine: GET/PUT/DEL/COUNT handlers, CSV snapshots and the
//! snapshot worker process.
//!
//! Values live in the shared heap as a length word followed by the
//! bytes; the records map stores their offsets. Every handler acquires
//! the gate, refreshes the heap mapping, operates and publishes change
//! events before releasing.

use crate::command::{Command, CommandTable};
use crate::error::ServerResult;
use crate::newsletter::NotificationKind;
use crate::process;
use crate::server::Server;
use kvsd_common::consts::{KEY_MAX_LEN, VALUE_MAX_LEN};
use kvsd_common::protocol;
use kvsd_common::wildcard::{contains_wildcard, match_wildcard};
use kvsd_shared_memory::{Allocator, Offset, SharedHeap, ShmResult};
use nix::unistd::{ForkResult, Pid, fork};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LEN_WORD: usize = std::mem::size_of::<usize>();

/// Register the storage commands.
pub fn register(table: &mut CommandTable) -> ServerResult<()> {
    table.register("GET", 1, true, cmd_get)?;
    table.register("PUT", 2, false, cmd_put)?;
    table.register("DEL", 1, true, cmd_del)?;
    Ok(())
}

/// Register the aggregate commands (after the canonical set).
pub fn register_aggregates(table: &mut CommandTable) -> ServerResult<()> {
    table.register("COUNT", 0, false, cmd_count)
}

// ─── Value blocks ──────────────────────────────────────────────────

/// Copy `data` into a fresh length-prefixed heap block.
pub(crate) fn write_value(heap: &mut SharedHeap, data: &[u8]) -> ShmResult<Offset> {
    let offset = heap.reserve(LEN_WORD + data.len())?;
    let bytes = heap.bytes_mut(offset, LEN_WORD + data.len());
    bytes[..LEN_WORD].copy_from_slice(&data.len().to_ne_bytes());
    bytes[LEN_WORD..].copy_from_slice(data);
    Ok(offset)
}

/// Read a length-prefixed value block.
pub(crate) fn read_value(heap: &SharedHeap, offset: Offset) -> Vec<u8> {
    let len = unsafe { *(heap.resolve(offset) as *const usize) };
    debug_assert!(len <= VALUE_MAX_LEN);
    heap.bytes(Offset::new(offset.get() + LEN_WORD), len).to_vec()
}

// ─── Locked primitives (shared with the OP executor) ───────────────

/// Outcome of a completed PUT.
pub(crate) enum PutOutcome {
    /// A new record was created.
    New,
    /// An existing record was replaced.
    Overwritten,
    /// The heap could not hold the value even after growth.
    Full,
}

/// Point lookup under the read gate.
pub(crate) fn get_record(server: &mut Server, key: &str) -> ShmResult<Option<Vec<u8>>> {
    server.gate.enter_read()?;
    let result = (|| -> ShmResult<Option<Vec<u8>>> {
        server.heap.refresh()?;
        let records = server.records;
        Ok(records
            .get(&server.heap, key.as_bytes())
            .map(|value| read_value(&server.heap, value)))
    })();
    server.gate.leave_read()?;
    result
}

/// Store `key → value` under the write gate, publishing the change.
pub(crate) fn put_record(server: &mut Server, key: &str, value: &[u8]) -> ShmResult<PutOutcome> {
    server.gate.enter_write()?;
    let result = put_locked(server, key, value);
    server.gate.leave_write()?;
    result
}

fn put_locked(server: &mut Server, key: &str, value: &[u8]) -> ShmResult<PutOutcome> {
    server.heap.refresh()?;
    let records = server.records;

    let block = match write_value(&mut server.heap, value) {
        Ok(block) => block,
        Err(e) => {
            warn!("value allocation failed: {e}");
            return Ok(PutOutcome::Full);
        }
    };

    match records.put(&mut server.heap, key.as_bytes(), block) {
        Ok(Some(displaced)) => {
            server.heap.release(displaced)?;
            publish(server, NotificationKind::Put, key, value);
            Ok(PutOutcome::Overwritten)
        }
        Ok(None) => {
            publish(server, NotificationKind::Put, key, value);
            Ok(PutOutcome::New)
        }
        Err(e) => {
            warn!("record insert failed: {e}");
            let _ = server.heap.release(block);
            Ok(PutOutcome::Full)
        }
    }
}

fn publish(server: &mut Server, kind: NotificationKind, key: &str, value: &[u8]) {
    let Server {
        heap, newsletter, ..
    } = server;
    if let Some(newsletter) = newsletter {
        let value = String::from_utf8_lossy(value);
        if let Err(e) = newsletter.publish(heap, kind, key, &value) {
            error!("change notification failed: {e}");
        }
    }
}

// ─── Command handlers ──────────────────────────────────────────────

fn cmd_get(server: &mut Server, cmd: &mut Command) -> bool {
    let result = (|| -> ShmResult<()> {
        server.gate.enter_read()?;
        let selected = (|| -> ShmResult<Vec<(String, Vec<u8>)>> {
            server.heap.refresh()?;
            let records = server.records;
            let mut selected: Vec<(String, Vec<u8>)> = Vec::new();

            if contains_wildcard(&cmd.key) {
                let mut matches = Vec::new();
                records.for_each(&server.heap, |key, value| {
                    let key = String::from_utf8_lossy(key).into_owned();
                    if match_wildcard(&key, &cmd.key) {
                        matches.push((key, value));
                    }
                });
                for (key, value) in matches {
                    selected.push((key, read_value(&server.heap, value)));
                }
            } else if let Some(value) = records.get(&server.heap, cmd.key.as_bytes()) {
                selected.push((cmd.key.clone(), read_value(&server.heap, value)));
            }
            Ok(selected)
        })();
        server.gate.leave_read()?;

        for (key, value) in selected? {
            cmd.push_record(key, String::from_utf8_lossy(&value).into_owned());
        }
        Ok(())
    })();

    if let Err(e) = result {
        error!("GET failed: {e}");
        return false;
    }
    if cmd.response_records.is_empty() {
        cmd.response_message = protocol::KEY_NONEXISTENT.to_string();
    }
    true
}

fn cmd_put(server: &mut Server, cmd: &mut Command) -> bool {
    match put_record(server, &cmd.key, cmd.value.as_bytes()) {
        Ok(PutOutcome::New) => {
            cmd.response_message = protocol::RECORD_NEW.to_string();
            true
        }
        Ok(PutOutcome::Overwritten) => {
            cmd.response_message = protocol::RECORD_OVERWRITTEN.to_string();
            true
        }
        Ok(PutOutcome::Full) => {
            cmd.response_message = protocol::STORAGE_FULL.to_string();
            true
        }
        Err(e) => {
            error!("PUT failed: {e}");
            false
        }
    }
}

fn cmd_del(server: &mut Server, cmd: &mut Command) -> bool {
    let result = (|| -> ShmResult<Vec<String>> {
        server.gate.enter_write()?;
        let removed = (|| -> ShmResult<Vec<String>> {
            server.heap.refresh()?;
            let records = server.records;

            let doomed: Vec<String> = if contains_wildcard(&cmd.key) {
                let mut keys = Vec::new();
                records.for_each(&server.heap, |key, _| {
                    let key = String::from_utf8_lossy(key).into_owned();
                    if match_wildcard(&key, &cmd.key) {
                        keys.push(key);
                    }
                });
                keys
            } else if records.contains(&server.heap, cmd.key.as_bytes()) {
                vec![cmd.key.clone()]
            } else {
                Vec::new()
            };

            let mut removed = Vec::new();
            for key in doomed {
                if let Some(value) = records.remove(&mut server.heap, key.as_bytes())? {
                    let data = read_value(&server.heap, value);
                    server.heap.release(value)?;
                    publish(server, NotificationKind::Del, &key, &data);
                    removed.push(key);
                }
            }
            Ok(removed)
        })();
        server.gate.leave_write()?;
        removed
    })();

    match result {
        Ok(removed) => {
            for key in removed {
                cmd.push_record(key, protocol::KEY_DELETED);
            }
            if cmd.response_records.is_empty() {
                cmd.response_message = protocol::KEY_NONEXISTENT.to_string();
            }
            true
        }
        Err(e) => {
            error!("DEL failed: {e}");
            false
        }
    }
}

fn cmd_count(server: &mut Server, cmd: &mut Command) -> bool {
    let result = (|| -> ShmResult<usize> {
        server.gate.enter_read()?;
        let len = (|| -> ShmResult<usize> {
            server.heap.refresh()?;
            Ok(server.records.len(&server.heap))
        })();
        server.gate.leave_read()?;
        len
    })();

    match result {
        Ok(len) => {
            cmd.response_message = len.to_string();
            true
        }
        Err(e) => {
            error!("COUNT failed: {e}");
            false
        }
    }
}

// ─── CSV snapshots ─────────────────────────────────────────────────

/// Load the snapshot file into the store. A missing file is an empty
/// start; malformed lines are skipped.
pub fn load_snapshot(server: &mut Server) -> ServerResult<()> {
    let path = server.config.storage_file.clone();
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no snapshot file, starting empty");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mut loaded = 0usize;
    let mut skipped = 0usize;
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(',') else {
            warn!(line, "skipping malformed snapshot line");
            skipped += 1;
            continue;
        };
        if key.is_empty() || key.len() > KEY_MAX_LEN || value.len() > VALUE_MAX_LEN {
            warn!(line, "skipping out-of-bounds snapshot line");
            skipped += 1;
            continue;
        }
        match put_record(server, key, value.as_bytes())? {
            PutOutcome::Full => {
                warn!(key, "storage full while loading snapshot");
                skipped += 1;
            }
            _ => loaded += 1,
        }
    }

    info!(loaded, skipped, path = %path.display(), "snapshot loaded");
    Ok(())
}

/// Serialize the store to the snapshot file, truncating it.
pub fn save_snapshot(server: &mut Server) -> ServerResult<()> {
    server.gate.enter_read()?;
    let serialized = (|| -> ShmResult<String> {
        server.heap.refresh()?;
        let records = server.records;

        let mut rows: Vec<(String, Offset)> = Vec::new();
        records.for_each(&server.heap, |key, value| {
            rows.push((String::from_utf8_lossy(key).into_owned(), value));
        });

        let mut out = String::new();
        for (key, value) in rows {
            let value = read_value(&server.heap, value);
            out.push_str(&key);
            out.push(',');
            out.push_str(&String::from_utf8_lossy(&value));
            out.push('\n');
        }
        Ok(out)
    })();
    server.gate.leave_read()?;

    std::fs::write(&server.config.storage_file, serialized?)?;
    debug!(path = %server.config.storage_file.display(), "snapshot written");
    Ok(())
}

/// Fork the periodic snapshot worker; `None` when disabled.
///
/// The worker dies with the parent (PDEATHSIG) and otherwise loops
/// sleep → read-lock → serialize forever.
pub fn spawn_snapshot_worker(server: &mut Server) -> ServerResult<Option<Pid>> {
    if !server.config.snapshots_enabled() {
        return Ok(None);
    }
    let interval = Duration::from_secs(server.config.snapshot_interval_secs);

    match unsafe { fork() }? {
        ForkResult::Child => {
            process::reset_child_signals();
            process::set_title("kvsd(snap)");
            process::die_with_parent();
            loop {
                std::thread::sleep(interval);
                if let Err(e) = save_snapshot(server) {
                    error!("periodic snapshot failed: {e}");
                }
            }
        }
        ForkResult::Parent { child } => {
            info!(pid = child.as_raw(), "snapshot worker started");
            Ok(Some(child))
        }
    }
}
