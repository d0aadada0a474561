//! Termination signal handling.
//!
//! SIGTERM and SIGINT clear a global flag that the event loop checks on
//! every iteration. The handlers are installed without `SA_RESTART`, so a
//! blocked `poll` returns `EINTR` and the loop notices promptly.

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::atomic::{AtomicBool, Ordering};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_handler(_: i32) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Install the SIGTERM and SIGINT handlers.
pub fn setup_signal_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(stop_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        unsafe { sigaction(sig, &action) }?;
    }
    Ok(())
}

pub fn running() -> bool {
    RUNNING.load(Ordering::SeqCst)
}
