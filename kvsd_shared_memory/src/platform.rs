//! Linux-specific shared memory plumbing.
//!
//! Segments are plain files under `/dev/shm`, mapped `MAP_SHARED` so that
//! forked processes inherit them. The process group is nudged with
//! `SIGUSR1` after a segment swap so that blocked children re-check the
//! update segment.

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, killpg, sigaction};
use nix::unistd::{getpgrp, getpid};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Allocation granularity of the kernel's shared mappings.
pub const PAGE_SIZE: usize = 4096;

/// Directory holding all kvsd segment files.
pub const SEGMENT_DIR: &str = "/dev/shm";

/// Full path of a named kvsd segment.
pub fn segment_path(name: &str) -> PathBuf {
    Path::new(SEGMENT_DIR).join(format!("kvsd_{name}"))
}

/// Create a segment file of `size` bytes and map it shared.
///
/// Fails with `AlreadyExists` if the file is already present, so a stale
/// instance is detected instead of silently reused.
pub fn create_segment_mmap(path: &Path, size: usize) -> ShmResult<MmapMut> {
    if size == 0 || size % PAGE_SIZE != 0 {
        return Err(ShmError::InvalidSize { size });
    }

    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                ShmError::AlreadyExists {
                    name: path.display().to_string(),
                }
            } else {
                ShmError::Io { source: e }
            }
        })?;

    file.set_len(size as u64)?;

    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

/// Map an existing segment file shared.
pub fn attach_segment_mmap(path: &Path) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ShmError::NotFound {
                    name: path.display().to_string(),
                }
            } else {
                ShmError::Io { source: e }
            }
        })?;

    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

/// Remove a segment file. Missing files are ignored.
pub fn unlink_segment(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Signal the whole process group that the data segment moved.
///
/// Receivers treat this as a nudge only; the authoritative state is the
/// generation word in the update segment.
pub fn notify_process_group() {
    if let Err(e) = killpg(getpgrp(), Signal::SIGUSR1) {
        tracing::warn!("reattach signal to process group failed: {e}");
    }
}

/// True when this process leads its own process group.
///
/// The server parent becomes group leader at startup so that the
/// reattach broadcast reaches exactly its children; a heap embedded in
/// another process group (tests, tooling) must not broadcast.
pub fn is_process_group_leader() -> bool {
    getpid().as_raw() == getpgrp().as_raw()
}

extern "C" fn reattach_nudge(_: libc::c_int) {
    // The handler only interrupts blocking calls; reattachment happens
    // at the allocator entry points that consult the update segment.
}

/// Install the no-op `SIGUSR1` handler.
///
/// Without it the default disposition would terminate a child that is
/// nudged while blocked in `msgrcv` or `semop`.
pub fn install_reattach_handler() -> ShmResult<()> {
    let action = SigAction::new(
        SigHandler::Handler(reattach_nudge),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGUSR1, &action) }?;
    Ok(())
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Round `size` up to the next multiple of `align` (a power of two).
pub const fn align_size(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_size_rounds_up() {
        assert_eq!(align_size(0, 16), 0);
        assert_eq!(align_size(1, 16), 16);
        assert_eq!(align_size(16, 16), 16);
        assert_eq!(align_size(17, 16), 32);
        assert_eq!(align_size(4097, PAGE_SIZE), 2 * PAGE_SIZE);
    }

    #[test]
    fn segment_paths_live_under_dev_shm() {
        let path = segment_path("unit_x");
        assert!(path.starts_with(SEGMENT_DIR));
        assert!(path.to_string_lossy().contains("kvsd_unit_x"));
    }

    #[test]
    fn create_attach_unlink_roundtrip() {
        let path = segment_path(&format!("platform_rt_{}", get_current_pid()));
        unlink_segment(&path);

        let mut created = create_segment_mmap(&path, PAGE_SIZE).unwrap();
        created[0] = 0xA5;

        // Second create must refuse to clobber.
        assert!(matches!(
            create_segment_mmap(&path, PAGE_SIZE),
            Err(ShmError::AlreadyExists { .. })
        ));

        let attached = attach_segment_mmap(&path).unwrap();
        assert_eq!(attached[0], 0xA5);

        unlink_segment(&path);
        assert!(matches!(
            attach_segment_mmap(&path),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn unaligned_sizes_rejected() {
        let path = segment_path("platform_unaligned");
        assert!(matches!(
            create_segment_mmap(&path, PAGE_SIZE + 1),
            Err(ShmError::InvalidSize { .. })
        ));
        assert!(matches!(
            create_segment_mmap(&path, 0),
            Err(ShmError::InvalidSize { .. })
        ));
    }
}
