//! Pub/sub newsletter: key subscriptions, observer processes and
//! change-event publication.
//!
//! A page-sized registry segment holds the mask of live subscriber IDs;
//! a second offset map in the shared heap carries one subscriber mask
//! per subscribed key. Each subscribing client forks one observer
//! process that blocks on the notification queue (typed by its ID) and
//! forwards PUT/DEL events to the client's command socket.
//!
//! Subscriptions are keyed by key string: the hashed storage has no
//! stable record slot, so a deleted key implicitly unsubscribes all of
//! its observers.

use crate::command::{self, Command, CommandTable};
use crate::error::{ServerError, ServerResult};
use crate::process;
use crate::server::Server;
use kvsd_common::consts::MAX_SUBSCRIBERS;
use kvsd_common::protocol;
use kvsd_shared_memory::platform::{PAGE_SIZE, create_segment_mmap, segment_path, unlink_segment};
use kvsd_shared_memory::{Allocator, NotifyQueue, Offset, OffsetMap, SharedHeap, ShmError, ShmResult};
use memmap2::MmapMut;
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

const MASK_LEN: usize = std::mem::size_of::<u64>();

/// Kind of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotificationKind {
    /// A subscription was added (observer counter + 1).
    Sub = 0,
    /// A subscription ended without an event line (counter − 1).
    Unsub = 1,
    /// A record was written.
    Put = 2,
    /// A record was deleted (counter − 1).
    Del = 3,
}

impl NotificationKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Sub),
            1 => Some(Self::Unsub),
            2 => Some(Self::Put),
            3 => Some(Self::Del),
            _ => None,
        }
    }
}

/// One queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Event kind.
    pub kind: NotificationKind,
    /// Affected key (empty for SUB/UNSUB bookkeeping).
    pub key: String,
    /// New value (PUT only).
    pub value: String,
}

impl Notification {
    /// Wire encoding: kind, key length, value length, then the bytes.
    pub fn encode(&self) -> Vec<u8> {
        let key = self.key.as_bytes();
        let value = self.value.as_bytes();
        let mut out = Vec::with_capacity(4 + key.len() + value.len());
        out.push(self.kind as u8);
        out.push(key.len() as u8);
        out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(value);
        out
    }

    /// Decode a queue message; `None` for malformed payloads.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let kind = NotificationKind::from_u8(data[0])?;
        let key_len = data[1] as usize;
        let value_len = u16::from_le_bytes([data[2], data[3]]) as usize;
        if data.len() < 4 + key_len + value_len {
            return None;
        }
        let key = String::from_utf8_lossy(&data[4..4 + key_len]).into_owned();
        let value =
            String::from_utf8_lossy(&data[4 + key_len..4 + key_len + value_len]).into_owned();
        Some(Self { kind, key, value })
    }
}

/// The newsletter module.
pub struct Newsletter {
    registry_mmap: MmapMut,
    registry_path: PathBuf,
    subscriptions: OffsetMap,
    queue: NotifyQueue,
    /// Socket of the client this (forked) process serves.
    pub client_socket: Option<TcpStream>,
    /// This client's subscriber ID, once claimed.
    subscriber: Option<u8>,
    /// This client's observer process.
    observer_pid: Option<Pid>,
}

impl Newsletter {
    /// Create the registry segment, the subscription map and the queue.
    pub fn create(namespace: &str, heap: &mut SharedHeap) -> ShmResult<Self> {
        let registry_path = segment_path(&format!("{namespace}_registry"));
        // The fresh segment file is zero-filled: no subscriber is live.
        let registry_mmap = create_segment_mmap(&registry_path, PAGE_SIZE)?;
        let subscriptions = OffsetMap::create(heap, 16, true)?;
        let queue = NotifyQueue::create()?;

        info!("newsletter module initialized");
        Ok(Self {
            registry_mmap,
            registry_path,
            subscriptions,
            queue,
            client_socket: None,
            subscriber: None,
            observer_pid: None,
        })
    }

    /// Remove the queue and the registry segment (owner teardown).
    pub fn destroy(self) {
        self.queue.destroy();
        unlink_segment(&self.registry_path);
        info!("newsletter module removed");
    }

    fn registry(&self) -> &AtomicU64 {
        unsafe { &*(self.registry_mmap.as_ptr() as *const AtomicU64) }
    }

    fn mtype(id: u8) -> i64 {
        id as i64 + 1
    }

    /// Claim the lowest clear registry bit, or `None` when full.
    fn claim_lowest_free(&self) -> Option<u8> {
        let taken = self.registry().load(Ordering::Acquire);
        for id in 0..MAX_SUBSCRIBERS as u8 {
            let bit = 1u64 << id;
            if taken & bit == 0 {
                self.registry().fetch_or(bit, Ordering::AcqRel);
                return Some(id);
            }
        }
        None
    }

    fn release_id(&self, id: u8) {
        self.registry().fetch_and(!(1u64 << id), Ordering::AcqRel);
    }

    /// Detect an observer that exited (its counter reached zero) so the
    /// slot can be claimed afresh on the next SUB.
    fn reap_observer(&mut self) {
        let Some(pid) = self.observer_pid else {
            return;
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            _ => {
                self.observer_pid = None;
                self.subscriber = None;
            }
        }
    }

    fn read_mask(heap: &SharedHeap, offset: Offset) -> u64 {
        let mut bytes = [0u8; MASK_LEN];
        bytes.copy_from_slice(heap.bytes(offset, MASK_LEN));
        u64::from_ne_bytes(bytes)
    }

    fn write_mask(heap: &mut SharedHeap, offset: Offset, mask: u64) {
        heap.bytes_mut(offset, MASK_LEN)
            .copy_from_slice(&mask.to_ne_bytes());
    }

    /// Set `id`'s bit in `key`'s mask; `false` when already set.
    fn set_subscription(&self, heap: &mut SharedHeap, key: &[u8], id: u8) -> ShmResult<bool> {
        let bit = 1u64 << id;
        if let Some(offset) = self.subscriptions.get(heap, key) {
            let mask = Self::read_mask(heap, offset);
            if mask & bit != 0 {
                return Ok(false);
            }
            Self::write_mask(heap, offset, mask | bit);
            return Ok(true);
        }
        let offset = heap.reserve(MASK_LEN)?;
        Self::write_mask(heap, offset, bit);
        self.subscriptions.put(heap, key, offset)?;
        Ok(true)
    }

    fn send_note(&self, id: u8, kind: NotificationKind, key: &str, value: &str) -> ShmResult<()> {
        let note = Notification {
            kind,
            key: key.to_string(),
            value: value.to_string(),
        };
        self.queue.send(Self::mtype(id), &note.encode())
    }

    /// Publish a storage mutation to every subscriber of `key`.
    ///
    /// PUT events skip the publishing subscriber itself (no echo); a DEL
    /// by a subscriber of the key turns into UNSUB for that client so
    /// its observer's counter stays balanced without an event line. DEL
    /// drops the key's whole mask: subscriptions are key-based, so a
    /// deleted key unsubscribes everyone.
    pub fn publish(
        &self,
        heap: &mut SharedHeap,
        kind: NotificationKind,
        key: &str,
        value: &str,
    ) -> ShmResult<()> {
        let Some(entry) = self.subscriptions.get(heap, key.as_bytes()) else {
            return Ok(());
        };
        let mask = Self::read_mask(heap, entry);
        let own_bit = self.subscriber.map(|id| 1u64 << id).unwrap_or(0);

        for id in 0..MAX_SUBSCRIBERS as u8 {
            let bit = 1u64 << id;
            if mask & bit == 0 {
                continue;
            }
            match kind {
                NotificationKind::Del => {
                    let kind = if bit == own_bit {
                        NotificationKind::Unsub
                    } else {
                        NotificationKind::Del
                    };
                    self.send_note(id, kind, key, value)?;
                }
                NotificationKind::Put => {
                    if bit == own_bit {
                        continue;
                    }
                    self.send_note(id, NotificationKind::Put, key, value)?;
                }
                NotificationKind::Sub | NotificationKind::Unsub => {}
            }
        }

        if kind == NotificationKind::Del {
            if let Some(offset) = self.subscriptions.remove(heap, key.as_bytes())? {
                heap.release(offset)?;
            }
        }
        Ok(())
    }
}

/// Register the SUB command.
pub fn register(table: &mut CommandTable) -> ServerResult<()> {
    table.register("SUB", 1, false, cmd_sub)
}

fn cmd_sub(server: &mut Server, cmd: &mut Command) -> bool {
    let key = cmd.key.clone();
    match sub_flow(server, &key) {
        Ok(message) => {
            cmd.response_message = message.to_string();
            true
        }
        Err(e) => {
            error!("SUB failed: {e}");
            false
        }
    }
}

fn sub_flow(server: &mut Server, key: &str) -> ServerResult<&'static str> {
    server.gate.enter_write()?;
    let result = sub_locked(server, key);
    server.gate.leave_write()?;
    result
}

fn sub_locked(server: &mut Server, key: &str) -> ServerResult<&'static str> {
    server.heap.refresh()?;
    let records = server.records;
    if !records.contains(&server.heap, key.as_bytes()) {
        return Ok(protocol::KEY_NONEXISTENT);
    }

    // Claim an ID and fork the observer on this client's first SUB.
    let claimed = {
        let Some(newsletter) = server.newsletter.as_mut() else {
            return Err(ServerError::Registration(
                "SUB dispatched with newsletter disabled".to_string(),
            ));
        };
        newsletter.reap_observer();
        if newsletter.subscriber.is_none() {
            match newsletter.claim_lowest_free() {
                Some(id) => Some(id),
                None => return Ok(protocol::SUBSCRIBERS_FULL),
            }
        } else {
            None
        }
    };

    if let Some(id) = claimed {
        match unsafe { fork() } {
            Err(e) => {
                if let Some(newsletter) = server.newsletter.as_ref() {
                    newsletter.release_id(id);
                }
                return Err(e.into());
            }
            Ok(ForkResult::Child) => {
                observer_main(server, id);
                std::process::exit(0);
            }
            Ok(ForkResult::Parent { child }) => {
                if let Some(newsletter) = server.newsletter.as_mut() {
                    newsletter.subscriber = Some(id);
                    newsletter.observer_pid = Some(child);
                }
            }
        }
    }

    let Server {
        heap, newsletter, ..
    } = server;
    let Some(newsletter) = newsletter.as_mut() else {
        return Err(ServerError::Registration(
            "SUB dispatched with newsletter disabled".to_string(),
        ));
    };
    let Some(id) = newsletter.subscriber else {
        return Err(ServerError::Registration(
            "subscriber id lost after claim".to_string(),
        ));
    };

    if !newsletter.set_subscription(heap, key.as_bytes(), id)? {
        return Ok(protocol::ALREADY_SUBSCRIBED);
    }
    newsletter.send_note(id, NotificationKind::Sub, "", "")?;
    Ok(protocol::SUBSCRIBED)
}

// ─── Observer process ──────────────────────────────────────────────

/// Observer body: forward queue events for `id` to the client socket
/// until the subscription counter drains or SIGTERM arrives.
fn observer_main(server: &mut Server, id: u8) {
    process::set_title("kvsd(sub)");
    process::die_with_parent();
    process::install_stop_handler();

    let Some(queue) = server.newsletter.as_ref().map(|n| n.queue) else {
        return;
    };
    let mtype = Newsletter::mtype(id);
    let mut counter: i64 = 0;

    loop {
        match queue.recv(mtype) {
            Ok(bytes) => {
                let Some(note) = Notification::decode(&bytes) else {
                    warn!("dropping malformed notification");
                    continue;
                };
                match note.kind {
                    NotificationKind::Sub => counter += 1,
                    NotificationKind::Unsub => counter -= 1,
                    NotificationKind::Del => {
                        counter -= 1;
                        forward(server, "DEL", &note.key, protocol::KEY_DELETED);
                    }
                    NotificationKind::Put => {
                        forward(server, "PUT", &note.key, &note.value);
                    }
                }
                if counter <= 0 {
                    break;
                }
            }
            Err(ShmError::Ipc {
                errno: Errno::EINTR,
                ..
            }) => {
                if process::shutdown_requested() {
                    break;
                }
            }
            Err(e) => {
                error!("observer receive failed: {e}");
                break;
            }
        }
    }

    observer_cleanup(server, id, counter);
}

/// Forward one event line to the client socket.
fn forward(server: &Server, name: &str, key: &str, value: &str) {
    let Some(socket) = server
        .newsletter
        .as_ref()
        .and_then(|n| n.client_socket.as_ref())
    else {
        return;
    };
    let line = command::record_line(name, key, value);
    if let Err(e) = (&*socket).write_all(line.as_bytes()) {
        warn!("notification forward failed: {e}");
    }
}

/// Return the subscriber ID and drop every trace of this observer.
fn observer_cleanup(server: &mut Server, id: u8, counter: i64) {
    if let Err(e) = server.gate.enter_write() {
        error!("observer cleanup lock failed: {e}");
    }
    let _ = server.heap.refresh();

    let Server {
        heap, newsletter, ..
    } = server;
    if let Some(newsletter) = newsletter.as_ref() {
        newsletter.release_id(id);

        if counter > 0 {
            // Remaining subscriptions of an abnormally ending observer.
            let bit = 1u64 << id;
            let mut entries = Vec::new();
            newsletter.subscriptions.for_each(heap, |_, value| {
                entries.push(value);
            });
            for offset in entries {
                let mask = Newsletter::read_mask(heap, offset);
                if mask & bit != 0 {
                    Newsletter::write_mask(heap, offset, mask & !bit);
                }
            }
        }

        // Drain unfetched messages for this ID.
        while let Ok(Some(_)) = newsletter.queue.try_recv(Newsletter::mtype(id)) {}
    }

    if let Err(e) = server.gate.leave_write() {
        error!("observer cleanup unlock failed: {e}");
    }
    info!(id, "observer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsd_shared_memory::SharedHeap;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_fixture() -> (SharedHeap, Newsletter) {
        let ns = format!(
            "nltest_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
        );
        let mut heap = SharedHeap::create(&ns, 64 * 1024).unwrap();
        let newsletter = Newsletter::create(&ns, &mut heap).unwrap();
        (heap, newsletter)
    }

    fn teardown(heap: SharedHeap, newsletter: Newsletter) {
        newsletter.destroy();
        heap.destroy();
    }

    #[test]
    fn notification_roundtrip() {
        let note = Notification {
            kind: NotificationKind::Put,
            key: "foo".to_string(),
            value: "some value".to_string(),
        };
        assert_eq!(Notification::decode(&note.encode()), Some(note));

        let bare = Notification {
            kind: NotificationKind::Sub,
            key: String::new(),
            value: String::new(),
        };
        assert_eq!(Notification::decode(&bare.encode()), Some(bare));
    }

    #[test]
    fn malformed_notifications_rejected() {
        assert_eq!(Notification::decode(&[]), None);
        assert_eq!(Notification::decode(&[9, 0, 0, 0]), None);
        // Truncated key.
        assert_eq!(Notification::decode(&[2, 5, 0, 0, b'a']), None);
    }

    #[test]
    fn subscriber_ids_claim_lowest_and_reuse_released() {
        let (heap, newsletter) = test_fixture();

        assert_eq!(newsletter.claim_lowest_free(), Some(0));
        assert_eq!(newsletter.claim_lowest_free(), Some(1));
        assert_eq!(newsletter.claim_lowest_free(), Some(2));

        newsletter.release_id(1);
        assert_eq!(newsletter.claim_lowest_free(), Some(1));

        teardown(heap, newsletter);
    }

    #[test]
    fn registry_fills_up() {
        let (heap, newsletter) = test_fixture();
        for id in 0..MAX_SUBSCRIBERS as u8 {
            assert_eq!(newsletter.claim_lowest_free(), Some(id));
        }
        assert_eq!(newsletter.claim_lowest_free(), None);

        // One leaves, the next SUB reuses the released ID.
        newsletter.release_id(17);
        assert_eq!(newsletter.claim_lowest_free(), Some(17));
        assert_eq!(newsletter.claim_lowest_free(), None);

        teardown(heap, newsletter);
    }

    #[test]
    fn subscription_masks_accumulate() {
        let (mut heap, newsletter) = test_fixture();

        assert!(newsletter.set_subscription(&mut heap, b"k", 3).unwrap());
        assert!(newsletter.set_subscription(&mut heap, b"k", 5).unwrap());
        // Same subscriber again: already subscribed.
        assert!(!newsletter.set_subscription(&mut heap, b"k", 3).unwrap());

        let entry = newsletter.subscriptions.get(&heap, b"k").unwrap();
        assert_eq!(Newsletter::read_mask(&heap, entry), (1 << 3) | (1 << 5));

        teardown(heap, newsletter);
    }

    #[test]
    fn put_events_skip_the_publisher() {
        let (mut heap, mut newsletter) = test_fixture();

        newsletter.set_subscription(&mut heap, b"x", 2).unwrap();
        newsletter.set_subscription(&mut heap, b"x", 5).unwrap();
        newsletter.subscriber = Some(2);

        newsletter
            .publish(&mut heap, NotificationKind::Put, "x", "42")
            .unwrap();

        // Subscriber 2 published: no echo for it.
        assert_eq!(newsletter.queue.try_recv(Newsletter::mtype(2)).unwrap(), None);
        let note = Notification::decode(
            &newsletter
                .queue
                .try_recv(Newsletter::mtype(5))
                .unwrap()
                .expect("subscriber 5 notified"),
        )
        .unwrap();
        assert_eq!(note.kind, NotificationKind::Put);
        assert_eq!(note.key, "x");
        assert_eq!(note.value, "42");

        teardown(heap, newsletter);
    }

    #[test]
    fn del_events_unsubscribe_and_soften_the_echo() {
        let (mut heap, mut newsletter) = test_fixture();

        newsletter.set_subscription(&mut heap, b"x", 2).unwrap();
        newsletter.set_subscription(&mut heap, b"x", 5).unwrap();
        newsletter.subscriber = Some(2);

        newsletter
            .publish(&mut heap, NotificationKind::Del, "x", "")
            .unwrap();

        // The publisher gets UNSUB (counter bookkeeping, no event line).
        let own = Notification::decode(
            &newsletter
                .queue
                .try_recv(Newsletter::mtype(2))
                .unwrap()
                .expect("publisher gets bookkeeping"),
        )
        .unwrap();
        assert_eq!(own.kind, NotificationKind::Unsub);

        let other = Notification::decode(
            &newsletter
                .queue
                .try_recv(Newsletter::mtype(5))
                .unwrap()
                .expect("subscriber 5 notified"),
        )
        .unwrap();
        assert_eq!(other.kind, NotificationKind::Del);
        assert_eq!(other.key, "x");

        // The key's whole subscription entry is gone.
        assert!(newsletter.subscriptions.get(&heap, b"x").is_none());

        teardown(heap, newsletter);
    }
}
