//! The dispatcher (C5): the daemon's main thread loop. Pulls requests off the
//! shared queue and hands each to an idle worker, or rejects it immediately
//! if every worker is busy.

use anyhow::{Context, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::ipc::SharedQueue;
use crate::protocol::SIG_FAILURE;

use super::shutdown::is_shutting_down;
use super::worker::WorkerPool;

/// Runs until `SIGTERM` interrupts the blocking dequeue and the shutdown flag
/// is observed, or the queue itself errors out.
pub fn run(queue: &SharedQueue, pool: &WorkerPool) -> Result<()> {
  loop {
    let req = match queue.dequeue_interruptible().context("dequeue failed")? {
      Some(req) => req,
      None => {
        if is_shutting_down() {
          log::info!("dispatcher: shutdown signal observed, exiting main loop");
          return Ok(());
        }
        // Some other signal interrupted the wait; keep serving requests.
        continue;
      }
    };
    log::debug!("dispatcher: dequeued request from pid {}", req.client_pid);
    if !pool.try_dispatch(req) {
      log::warn!(
        "dispatcher: no idle worker for pid {}, rejecting",
        req.client_pid
      );
      if let Err(err) = kill(Pid::from_raw(req.client_pid), SIG_FAILURE) {
        log::warn!(
          "dispatcher: failed to notify pid {} of rejection: {err}",
          req.client_pid
        );
      }
    }
  }
}
