//! Wire-level shapes shared between the client and the daemon: the fixed-size
//! request record placed in shared memory, and the well-known names of the
//! POSIX objects both sides rendezvous on.

use anyhow::{Result, bail};
use nix::sys::signal::Signal;

/// Upper bound on the command string, mirroring the source's `ARG_MAX` fallback.
pub const CMD_MAX: usize = 4096;
/// Upper bound on the per-request pipe path, mirroring the source's `PATH_MAX` fallback.
pub const PIPE_NAME_MAX: usize = 4096;

const QUEUE_NAME_BASE: &str = "/cmdl_shm_queue";
const SINGLETON_NAME_BASE: &str = "/cmdld_run_mutex";
const PID_CELL_NAME_BASE: &str = "/cmdld_shm_pid";

/// Tests running concurrently would otherwise collide on these host-global
/// POSIX names; setting this env var gives each test run its own namespace.
/// Unset in production, where the names below are used exactly as documented.
const NAMESPACE_ENV_VAR: &str = "CMDL_TEST_NAMESPACE";

fn namespaced(base: &str) -> String {
  match std::env::var(NAMESPACE_ENV_VAR) {
    Ok(ns) if !ns.is_empty() => format!("{base}_{ns}"),
    _ => base.to_string(),
  }
}

pub fn queue_name() -> String {
  namespaced(QUEUE_NAME_BASE)
}

pub fn singleton_name() -> String {
  namespaced(SINGLETON_NAME_BASE)
}

pub fn pid_cell_name() -> String {
  namespaced(PID_CELL_NAME_BASE)
}

/// Worker-to-client failure verdict; daemon-to-client admission rejection.
pub const SIG_FAILURE: Signal = Signal::SIGUSR1;
/// Worker-to-client success verdict; detached-child-to-starter daemonisation confirmation.
pub const SIG_SUCCESS: Signal = Signal::SIGUSR2;
/// Stop-tool-to-daemon shutdown request.
pub const SIG_TERMINATE: Signal = Signal::SIGTERM;

/// A work item handed from client to daemon. Fixed-size and trivially copyable so it
/// can be memcpy'd in and out of shared-memory slots without pointers or allocation.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Request {
  cmd: [u8; CMD_MAX],
  cmd_len: u32,
  pipe_name: [u8; PIPE_NAME_MAX],
  pipe_name_len: u32,
  pub client_pid: libc::pid_t,
}

impl Request {
  /// `client_pid = 0` is the sentinel meaning "no outstanding request", used by a
  /// worker between requests and observed by shutdown to know whether to signal it.
  pub const NONE: Request = Request {
    cmd: [0; CMD_MAX],
    cmd_len: 0,
    pipe_name: [0; PIPE_NAME_MAX],
    pipe_name_len: 0,
    client_pid: 0,
  };

  pub fn new(cmd: &str, pipe_name: &str, client_pid: libc::pid_t) -> Result<Self> {
    if cmd.len() > CMD_MAX {
      bail!("command too long: {} bytes, max {CMD_MAX}", cmd.len());
    }
    if pipe_name.len() > PIPE_NAME_MAX {
      bail!(
        "pipe name too long: {} bytes, max {PIPE_NAME_MAX}",
        pipe_name.len()
      );
    }
    let mut req = Request::NONE;
    req.cmd[..cmd.len()].copy_from_slice(cmd.as_bytes());
    req.cmd_len = cmd.len() as u32;
    req.pipe_name[..pipe_name.len()].copy_from_slice(pipe_name.as_bytes());
    req.pipe_name_len = pipe_name.len() as u32;
    req.client_pid = client_pid;
    Ok(req)
  }

  pub fn cmd(&self) -> &str {
    std::str::from_utf8(&self.cmd[..self.cmd_len as usize]).unwrap_or_default()
  }

  pub fn pipe_name(&self) -> &str {
    std::str::from_utf8(&self.pipe_name[..self.pipe_name_len as usize]).unwrap_or_default()
  }

  pub fn is_none(&self) -> bool {
    self.client_pid == 0
  }

  /// Returns the request's raw bytes, for handing to the shared queue.
  pub(crate) fn as_bytes(&self) -> &[u8] {
    // SAFETY: Request is repr(C) and contains no padding-sensitive invariants; every
    // bit pattern reachable via `new`/`NONE` is a valid byte sequence to copy.
    unsafe {
      std::slice::from_raw_parts(
        (self as *const Request).cast::<u8>(),
        std::mem::size_of::<Request>(),
      )
    }
  }

  /// Reconstructs a `Request` from raw bytes previously produced by `as_bytes`.
  ///
  /// # Safety
  /// `bytes` must be exactly `size_of::<Request>()` bytes, previously written by
  /// `as_bytes` on a value of this type (the queue never stores anything else).
  pub(crate) unsafe fn from_bytes(bytes: &[u8]) -> Self {
    debug_assert_eq!(bytes.len(), std::mem::size_of::<Request>());
    let mut req = Request::NONE;
    unsafe {
      std::ptr::copy_nonoverlapping(
        bytes.as_ptr(),
        (&mut req as *mut Request).cast::<u8>(),
        std::mem::size_of::<Request>(),
      );
    }
    req
  }
}

/// Per-request named pipe path for a given client pid, per the external interface spec.
pub fn client_pipe_path(pid: libc::pid_t) -> String {
  format!("/tmp/cmdl_pipe_{pid}")
}

/// Transient handshake pipe path for a given daemon starter pid.
pub fn handshake_pipe_path(starter_pid: libc::pid_t) -> String {
  format!("/tmp/cmdld_pipe.{starter_pid}")
}
