//! The client driver (C7): builds a request, hands it to the daemon over the
//! shared queue, streams the command's output back over a private named
//! pipe, and reports the daemon's verdict as this process's own exit status.

use std::fs::File;
use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use nix::sys::signal::{SigHandler, SigSet, Signal, SigmaskHow, sigaction, sigprocmask};
use nix::sys::stat::Mode;
use nix::unistd::{getpid, mkfifo, unlink};

use crate::ipc::SharedQueue;
use crate::protocol::{Request, client_pipe_path, queue_name};
use crate::utils::log::t;

const READ_CHUNK: usize = 4096;

extern "C" fn handle_failure(_: libc::c_int) {
  // A bare write to stderr here would need to go through Rust's formatting
  // machinery; matching the original driver, we accept exiting directly from
  // the handler since the whole point of this signal is "stop now".
  eprintln!("{}", t::err("request aborted"));
  std::process::exit(1);
}

extern "C" fn handle_success(_: libc::c_int) {
  std::process::exit(0);
}

fn install_handlers() -> Result<()> {
  // SAFETY: both handlers only call eprintln!/exit, accepted here as the
  // documented exception to async-signal-safety (see daemon::worker for the
  // strict discipline used where it actually matters, around fork/exec).
  unsafe {
    sigaction(
      Signal::SIGUSR1,
      &nix::sys::signal::SigAction::new(
        SigHandler::Handler(handle_failure),
        nix::sys::signal::SaFlags::empty(),
        SigSet::empty(),
      ),
    )
    .context("failed to install SIGUSR1 handler")?;
    sigaction(
      Signal::SIGUSR2,
      &nix::sys::signal::SigAction::new(
        SigHandler::Handler(handle_success),
        nix::sys::signal::SaFlags::empty(),
        SigSet::empty(),
      ),
    )
    .context("failed to install SIGUSR2 handler")?;
  }
  Ok(())
}

/// Submits `cmd` to the daemon and blocks until its verdict arrives, streaming
/// any output the command produces to this process's own stdout as it comes.
///
/// Never returns normally: the daemon's verdict always arrives as SIGUSR1 or
/// SIGUSR2, and both handlers terminate the process directly.
pub fn run(cmd: &str) -> Result<()> {
  install_handlers()?;

  // Block SIGUSR2 until the output stream is fully drained, so a command that
  // finishes before we've opened the pipe can't have its success verdict
  // short-circuit us out before we've read anything.
  let mut armed = SigSet::empty();
  armed.add(Signal::SIGUSR2);
  sigprocmask(SigmaskHow::SIG_BLOCK, Some(&armed), None)
    .context("failed to mask SIGUSR2")?;

  let pid = getpid().as_raw();
  let pipe_path = client_pipe_path(pid);
  mkfifo(pipe_path.as_str(), Mode::from_bits_truncate(0o600))
    .context("failed to create response pipe")?;

  let queue = SharedQueue::open(&queue_name()).context("failed to reach daemon")?;
  let req = Request::new(cmd, &pipe_path, pid).context("request does not fit the wire format")?;
  queue.enqueue(&req).context("failed to enqueue request")?;

  stream_output(&pipe_path)?;
  let _ = unlink(pipe_path.as_str());

  // Unblock SIGUSR2: if the daemon's success signal arrived while masked,
  // it is delivered now; otherwise we park until either verdict arrives.
  sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&armed), None)
    .context("failed to unmask SIGUSR2")?;
  loop {
    std::thread::park();
  }
}

fn stream_output(pipe_path: &str) -> Result<()> {
  // Opening for read blocks until the daemon's worker opens its write end.
  let mut pipe = File::open(pipe_path).context("failed to open response pipe")?;
  let mut buf = [0u8; READ_CHUNK];
  let mut stdout = io::stdout();
  loop {
    let n = pipe.read(&mut buf).context("failed to read response pipe")?;
    if n == 0 {
      return Ok(());
    }
    stdout
      .write_all(&buf[..n])
      .context("failed to write command output")?;
  }
}
