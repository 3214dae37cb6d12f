//! SysV message queue carrying change notifications.
//!
//! One queue serves all subscribers: messages are typed by subscriber ID
//! so every observer process receives exactly its own traffic
//! (`msgrcv(type = id)`), FIFO per type. The queue id is inherited
//! across `fork`, so no name lookup is needed.

use crate::error::{ShmError, ShmResult};
use kvsd_common::consts::{KEY_MAX_LEN, VALUE_MAX_LEN};
use nix::errno::Errno;

/// Maximum payload of one queue message: kind, key and value fields of
/// an encoded notification.
pub const MAX_MESSAGE_LEN: usize = 4 + KEY_MAX_LEN + VALUE_MAX_LEN;

#[repr(C)]
struct MsgBuf {
    mtype: libc::c_long,
    mtext: [u8; MAX_MESSAGE_LEN],
}

/// Handle to the notification queue.
///
/// Plain data: copies in forked children operate on the same kernel
/// object. Exactly one process (the creator) calls [`NotifyQueue::destroy`].
#[derive(Debug, Clone, Copy)]
pub struct NotifyQueue {
    msqid: libc::c_int,
}

impl NotifyQueue {
    /// Create a fresh private queue.
    pub fn create() -> ShmResult<Self> {
        let msqid = unsafe { libc::msgget(libc::IPC_PRIVATE, libc::IPC_CREAT | 0o600) };
        if msqid == -1 {
            return Err(ShmError::Ipc {
                call: "msgget",
                errno: Errno::last(),
            });
        }
        tracing::info!(msqid, "notification queue created");
        Ok(Self { msqid })
    }

    /// Kernel id of the queue.
    pub fn id(&self) -> i32 {
        self.msqid
    }

    /// Send `data` typed by `mtype` (must be positive).
    pub fn send(&self, mtype: i64, data: &[u8]) -> ShmResult<()> {
        debug_assert!(mtype > 0);
        debug_assert!(data.len() <= MAX_MESSAGE_LEN);

        let mut buf = MsgBuf {
            mtype: mtype as libc::c_long,
            mtext: [0; MAX_MESSAGE_LEN],
        };
        buf.mtext[..data.len()].copy_from_slice(data);

        loop {
            let rc = unsafe {
                libc::msgsnd(
                    self.msqid,
                    &buf as *const MsgBuf as *const libc::c_void,
                    data.len(),
                    0,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(ShmError::Ipc {
                    call: "msgsnd",
                    errno,
                });
            }
        }
    }

    /// Receive the next message of `mtype`, blocking.
    ///
    /// `EINTR` is surfaced to the caller (as `ShmError::Ipc`) so a
    /// signal-interrupted observer can check its shutdown flag before
    /// retrying.
    pub fn recv(&self, mtype: i64) -> ShmResult<Vec<u8>> {
        self.recv_flags(mtype, 0).map(|data| {
            data.unwrap_or_default() // blocking recv never yields None
        })
    }

    /// Receive the next message of `mtype`, or `None` when the queue
    /// holds none. `EINTR` is retried here.
    pub fn try_recv(&self, mtype: i64) -> ShmResult<Option<Vec<u8>>> {
        loop {
            match self.recv_flags(mtype, libc::IPC_NOWAIT) {
                Err(ShmError::Ipc {
                    errno: Errno::EINTR,
                    ..
                }) => continue,
                other => return other,
            }
        }
    }

    fn recv_flags(&self, mtype: i64, flags: libc::c_int) -> ShmResult<Option<Vec<u8>>> {
        let mut buf = MsgBuf {
            mtype: 0,
            mtext: [0; MAX_MESSAGE_LEN],
        };
        let received = unsafe {
            libc::msgrcv(
                self.msqid,
                &mut buf as *mut MsgBuf as *mut libc::c_void,
                MAX_MESSAGE_LEN,
                mtype as libc::c_long,
                flags,
            )
        };
        if received == -1 {
            let errno = Errno::last();
            if errno == Errno::ENOMSG {
                return Ok(None);
            }
            return Err(ShmError::Ipc {
                call: "msgrcv",
                errno,
            });
        }
        debug_assert!(buf.mtype > 0);
        Ok(Some(buf.mtext[..received as usize].to_vec()))
    }

    /// Remove the queue (owner teardown).
    pub fn destroy(&self) {
        unsafe { libc::msgctl(self.msqid, libc::IPC_RMID, std::ptr::null_mut()) };
        tracing::info!(msqid = self.msqid, "notification queue removed");
    }
}
