//! Process plumbing: titles, parent-death wiring, signal dispositions.
//!
//! The server is a family of forked single-threaded processes; this
//! module centralizes the small amount of per-process setup each family
//! member performs after `fork`.

use nix::sys::prctl;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{Pid, setpgid};
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Set when SIGINT or SIGTERM arrives; polled by the accept and
/// observer loops after their blocking calls return `EINTR`.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// True once a termination signal arrived.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Route SIGINT and SIGTERM into the shutdown flag.
///
/// The handlers deliberately lack `SA_RESTART`: a blocked `accept` or
/// `msgrcv` returns `EINTR` and its loop re-checks the flag.
pub fn install_shutdown_handlers() {
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        if let Err(e) = unsafe { signal(sig, SigHandler::Handler(request_shutdown)) } {
            warn!("installing {sig} handler failed: {e}");
        }
    }
}

/// Become leader of a fresh process group.
///
/// The heap's reattach broadcast targets the server's own group; done
/// before any segment is created.
pub fn become_group_leader() {
    if let Err(e) = setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
        warn!("setpgid failed: {e}");
    }
}

/// Auto-reap children (the parent's client handler processes).
pub fn ignore_children() {
    if let Err(e) = unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) } {
        warn!("ignoring SIGCHLD failed: {e}");
    }
}

/// Restore default dispositions in a freshly forked child.
///
/// Children must not inherit the parent's shutdown routing, and a client
/// handler needs a waitable SIGCHLD for its observer process.
pub fn reset_child_signals() {
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD] {
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }
}

/// Set the process title shown by `ps`.
pub fn set_title(title: &str) {
    if let Ok(name) = CString::new(title) {
        let _ = prctl::set_name(&name);
    }
}

/// Arrange for SIGTERM when the parent process dies.
pub fn die_with_parent() {
    if let Err(e) = prctl::set_pdeathsig(Signal::SIGTERM) {
        warn!("set_pdeathsig failed: {e}");
    }
}

/// Route SIGTERM into the shutdown flag (observer processes).
pub fn install_stop_handler() {
    if let Err(e) = unsafe { signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown)) } {
        warn!("installing SIGTERM handler failed: {e}");
    }
}
