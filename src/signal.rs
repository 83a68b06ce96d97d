//! Process signal plumbing.
//!
//! Handlers only set flags; the acceptor thread services them on its next
//! loop iteration. Worker threads run with these signals blocked so the
//! acceptor is the one thread whose blocking reads get interrupted.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SUBSCRIPTION_RESET: AtomicBool = AtomicBool::new(false);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_subscription_reset(_: libc::c_int) {
    SUBSCRIPTION_RESET.store(true, Ordering::Release);
}

extern "C" fn on_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

/// Installs the server's handlers: `SIGUSR1` requests a subscription reset,
/// `SIGINT`/`SIGTERM` request shutdown. No `SA_RESTART` — a signal must
/// interrupt the acceptor's blocking reads so the flag gets serviced.
///
/// # Errors
/// Fails when a handler cannot be installed.
pub fn install_server_handlers() -> io::Result<()> {
    let reset = SigAction::new(
        SigHandler::Handler(on_subscription_reset),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let shutdown = SigAction::new(
        SigHandler::Handler(on_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGUSR1, &reset).map_err(io::Error::from)?;
        signal::sigaction(Signal::SIGINT, &shutdown).map_err(io::Error::from)?;
        signal::sigaction(Signal::SIGTERM, &shutdown).map_err(io::Error::from)?;
    }
    Ok(())
}

/// Writes to a peer-closed pipe must fail with `EPIPE` instead of killing
/// the process.
pub fn ignore_sigpipe() {
    unsafe {
        if let Err(err) = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) {
            warn!("failed to ignore SIGPIPE: {err}");
        }
    }
}

/// Consumes a pending subscription-reset request.
pub fn take_subscription_reset() -> bool {
    SUBSCRIPTION_RESET.swap(false, Ordering::AcqRel)
}

/// Whether shutdown has been requested by a signal.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Acquire)
}

/// Blocks the administrative and shutdown signals in the calling worker
/// thread.
pub(crate) fn block_in_worker() {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGUSR1);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGPIPE);
    if let Err(err) = mask.thread_block() {
        warn!("failed to mask signals in a worker thread: {err}");
    }
}
