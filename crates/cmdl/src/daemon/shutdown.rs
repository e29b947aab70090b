//! Shutdown coordination (C8). A single global flag is the one state any
//! signal handler is allowed to touch; everything else (waking workers,
//! unlinking named objects, exiting) happens back on the main thread once it
//! observes the flag, not inside the handler itself.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{SigHandler, Signal, signal};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn is_shutting_down() -> bool {
  SHUTDOWN.load(Ordering::Acquire)
}

extern "C" fn handle_sigterm(_: libc::c_int) {
  SHUTDOWN.store(true, Ordering::Release);
}

/// Installs the `SIGTERM` handler. Must be called once, early in daemon
/// bootstrap, before the dispatcher starts blocking on the request queue.
pub fn install_handler() -> Result<()> {
  // SAFETY: handle_sigterm only stores to an AtomicBool, which is
  // async-signal-safe; no allocation, locking, or I/O happens in the handler.
  unsafe {
    signal(Signal::SIGTERM, SigHandler::Handler(handle_sigterm))
      .context("failed to install SIGTERM handler")?;
  }
  Ok(())
}
