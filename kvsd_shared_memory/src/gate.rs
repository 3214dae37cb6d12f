//! Process-shared reader/writer gate.
//!
//! The classic readers-preferred lock built from a SysV semaphore set of
//! two counting semaphores (`storage_gate`, `reader_counter_gate`, both
//! initially 1) and a reader counter in the gate's own page-sized shared
//! mapping. SysV is used because it is the one primitive whose tokens are
//! returned on process death (`SEM_UNDO`), which keeps an abnormally
//! dying client from deadlocking the server.
//!
//! `SEM_UNDO` is applied to every operation whose P and V happen in the
//! same process: the short `reader_counter_gate` sections and the
//! write-mode `storage_gate` sections (including the BEG/END latch). The
//! reader-side `storage_gate` token is taken by the first reader and
//! returned by the last, possibly a different process, where an undo
//! adjustment would corrupt the semaphore; those two operations run
//! without undo.

use crate::error::{ShmError, ShmResult};
use crate::platform::{PAGE_SIZE, create_segment_mmap, segment_path, unlink_segment};
use memmap2::MmapMut;
use nix::errno::Errno;
use std::path::PathBuf;

/// Semaphore index of the storage gate.
const SEM_STORAGE: u16 = 0;
/// Semaphore index of the reader-counter gate.
const SEM_READERS: u16 = 1;

/// Shared state of the gate.
#[repr(C)]
struct GateHeader {
    reader_counter: i32,
}

/// Readers-preferred reader/writer gate with an exclusive-mode latch.
///
/// Created once by the server parent. Children inherit the semaphore id
/// and the shared counter mapping across `fork`; the `exclusive` latch
/// is per-process state and starts cleared in every child.
pub struct StorageGate {
    semid: libc::c_int,
    mmap: MmapMut,
    path: PathBuf,
    exclusive: bool,
}

impl StorageGate {
    /// Create the gate for `namespace`: both semaphores at 1, counter 0.
    pub fn create(namespace: &str) -> ShmResult<Self> {
        let path = segment_path(&format!("{namespace}_gate"));
        let mmap = create_segment_mmap(&path, PAGE_SIZE)?;

        let semid = unsafe { libc::semget(libc::IPC_PRIVATE, 2, libc::IPC_CREAT | 0o600) };
        if semid == -1 {
            unlink_segment(&path);
            return Err(ShmError::Ipc {
                call: "semget",
                errno: Errno::last(),
            });
        }

        for index in [SEM_STORAGE, SEM_READERS] {
            let rc = unsafe { libc::semctl(semid, index as libc::c_int, libc::SETVAL, 1) };
            if rc == -1 {
                let errno = Errno::last();
                unsafe { libc::semctl(semid, 0, libc::IPC_RMID) };
                unlink_segment(&path);
                return Err(ShmError::Ipc {
                    call: "semctl",
                    errno,
                });
            }
        }

        let gate = Self {
            semid,
            mmap,
            path,
            exclusive: false,
        };
        unsafe { *gate.counter() = 0 };

        tracing::info!(semid, "storage gate created");
        Ok(gate)
    }

    /// One semaphore operation, retried through `EINTR`.
    fn semop(&self, index: u16, op: i16, undo: bool) -> ShmResult<()> {
        let mut buf = libc::sembuf {
            sem_num: index,
            sem_op: op,
            sem_flg: if undo { libc::SEM_UNDO as i16 } else { 0 },
        };
        loop {
            let rc = unsafe { libc::semop(self.semid, &mut buf, 1) };
            if rc == 0 {
                return Ok(());
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(ShmError::Ipc {
                    call: "semop",
                    errno,
                });
            }
        }
    }

    fn counter(&self) -> *mut i32 {
        unsafe { &raw mut (*(self.mmap.as_ptr() as *mut GateHeader)).reader_counter }
    }

    /// Enter a read section. No-op while this process is exclusive.
    pub fn enter_read(&self) -> ShmResult<()> {
        if self.exclusive {
            return Ok(());
        }
        self.semop(SEM_READERS, -1, true)?;
        let readers = unsafe {
            *self.counter() += 1;
            *self.counter()
        };
        if readers == 1 {
            self.semop(SEM_STORAGE, -1, false)?;
        }
        self.semop(SEM_READERS, 1, true)
    }

    /// Leave a read section. No-op while this process is exclusive.
    pub fn leave_read(&self) -> ShmResult<()> {
        if self.exclusive {
            return Ok(());
        }
        self.semop(SEM_READERS, -1, true)?;
        let readers = unsafe {
            *self.counter() -= 1;
            *self.counter()
        };
        if readers == 0 {
            self.semop(SEM_STORAGE, 1, false)?;
        }
        self.semop(SEM_READERS, 1, true)
    }

    /// Enter a write section. No-op while this process is exclusive.
    pub fn enter_write(&self) -> ShmResult<()> {
        if self.exclusive {
            return Ok(());
        }
        self.semop(SEM_STORAGE, -1, true)
    }

    /// Leave a write section. No-op while this process is exclusive.
    pub fn leave_write(&self) -> ShmResult<()> {
        if self.exclusive {
            return Ok(());
        }
        self.semop(SEM_STORAGE, 1, true)
    }

    /// BEG: acquire the gate for this process until `end_exclusive`.
    ///
    /// Returns `false` when this process is already exclusive. Blocks
    /// while another client holds the gate.
    pub fn begin_exclusive(&mut self) -> ShmResult<bool> {
        if self.exclusive {
            return Ok(false);
        }
        self.semop(SEM_STORAGE, -1, true)?;
        self.exclusive = true;
        Ok(true)
    }

    /// END: release the gate. Returns `false` when not exclusive.
    pub fn end_exclusive(&mut self) -> ShmResult<bool> {
        if !self.exclusive {
            return Ok(false);
        }
        self.exclusive = false;
        self.semop(SEM_STORAGE, 1, true)?;
        Ok(true)
    }

    /// True while this process holds the exclusive latch.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Current reader count (diagnostic only; racy by nature).
    pub fn reader_count(&self) -> i32 {
        unsafe { *self.counter() }
    }

    /// Remove the semaphore set and the counter mapping (owner teardown).
    pub fn destroy(self) {
        unsafe { libc::semctl(self.semid, 0, libc::IPC_RMID) };
        unlink_segment(&self.path);
        tracing::info!(semid = self.semid, "storage gate removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::get_current_pid;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_gate() -> StorageGate {
        let ns = format!(
            "gatetest_{}_{}",
            get_current_pid(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        StorageGate::create(&ns).unwrap()
    }

    #[test]
    fn read_sections_nest_across_enters() {
        let gate = test_gate();
        gate.enter_read().unwrap();
        gate.enter_read().unwrap();
        assert_eq!(gate.reader_count(), 2);
        gate.leave_read().unwrap();
        assert_eq!(gate.reader_count(), 1);
        gate.leave_read().unwrap();
        assert_eq!(gate.reader_count(), 0);

        // The storage token is back: a write section succeeds.
        gate.enter_write().unwrap();
        gate.leave_write().unwrap();
        gate.destroy();
    }

    #[test]
    fn exclusive_latch_flips_once() {
        let mut gate = test_gate();
        assert!(!gate.is_exclusive());
        assert!(gate.begin_exclusive().unwrap());
        assert!(gate.is_exclusive());
        // Second BEG from the same process reports already-locked.
        assert!(!gate.begin_exclusive().unwrap());

        // Enter/leave are no-ops while exclusive; they must not block
        // even though the storage token is held.
        gate.enter_read().unwrap();
        gate.leave_read().unwrap();
        gate.enter_write().unwrap();
        gate.leave_write().unwrap();

        assert!(gate.end_exclusive().unwrap());
        assert!(!gate.end_exclusive().unwrap());

        gate.enter_write().unwrap();
        gate.leave_write().unwrap();
        gate.destroy();
    }

    #[test]
    fn write_section_excludes_readers_token() {
        let gate = test_gate();
        gate.enter_write().unwrap();
        // The first reader would block on the storage token here, which
        // is exactly the exclusion the gate provides.
        gate.leave_write().unwrap();
        gate.enter_read().unwrap();
        gate.leave_read().unwrap();
        gate.destroy();
    }
}
