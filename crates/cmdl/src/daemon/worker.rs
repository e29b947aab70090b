//! The worker pool (C6): a fixed number of long-lived threads, each capable of
//! forking a child to run one request's command and reporting a verdict back
//! to the client by signal.

use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::kill;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, dup2, execvp, fork};
use parking_lot::Mutex;

use crate::protocol::{Request, SIG_FAILURE, SIG_SUCCESS};

use super::shutdown::is_shutting_down;

/// Per-worker state shared between the dispatcher thread (which assigns work)
/// and the worker's own thread (which runs it).
pub struct WorkerSlot {
  available: AtomicBool,
  /// Private wakeup semaphore; posted by the dispatcher when handing off a
  /// request, and once (unconditionally) during shutdown to unblock an idle
  /// worker so it can observe the shutdown flag and exit its loop.
  wakeup: crate::ipc::PrivateSemaphore,
  pending: Mutex<Option<Request>>,
  /// pid of the client whose request this worker currently holds, or 0 if
  /// idle. Read by shutdown to know whether an in-flight request needs a
  /// failure verdict sent before the daemon exits.
  current_client_pid: AtomicI32,
}

impl WorkerSlot {
  fn new() -> Result<Self> {
    Ok(Self {
      available: AtomicBool::new(true),
      wakeup: crate::ipc::PrivateSemaphore::new(0)?,
      pending: Mutex::new(None),
      current_client_pid: AtomicI32::new(0),
    })
  }

  pub fn current_client_pid(&self) -> libc::pid_t {
    self.current_client_pid.load(Ordering::Acquire)
  }
}

pub struct WorkerPool {
  slots: Vec<Arc<WorkerSlot>>,
  handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
  /// Spawns `worker_max` idle worker threads.
  pub fn spawn(worker_max: u32) -> Result<Self> {
    let mut slots = Vec::with_capacity(worker_max as usize);
    let mut handles = Vec::with_capacity(worker_max as usize);
    for id in 0..worker_max {
      let slot = Arc::new(WorkerSlot::new().context("failed to create worker wakeup semaphore")?);
      let slot_for_thread = Arc::clone(&slot);
      let handle = std::thread::Builder::new()
        .name(format!("cmdl-worker-{id}"))
        .spawn(move || worker_loop(id, slot_for_thread))
        .with_context(|| format!("failed to spawn worker thread {id}"))?;
      slots.push(slot);
      handles.push(handle);
    }
    Ok(Self { slots, handles })
  }

  /// Finds an idle worker and hands it `req`. Returns `false` if every worker
  /// is currently busy (the dispatcher's admission-reject path).
  pub fn try_dispatch(&self, req: Request) -> bool {
    for slot in &self.slots {
      if slot
        .available
        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
      {
        slot.current_client_pid.store(req.client_pid, Ordering::Release);
        *slot.pending.lock() = Some(req);
        let _ = slot.wakeup.post();
        return true;
      }
    }
    false
  }

  /// Wakes every worker so idle ones observe the shutdown flag and exit, then
  /// reports any still mid-request so the caller can send it a failure
  /// verdict before the daemon disappears.
  pub fn shutdown(self) -> Vec<libc::pid_t> {
    let mut stranded = Vec::new();
    for slot in &self.slots {
      let pid = slot.current_client_pid();
      if pid != 0 {
        stranded.push(pid);
      }
      let _ = slot.wakeup.post();
    }
    for handle in self.handles {
      let _ = handle.join();
    }
    stranded
  }
}

fn worker_loop(id: u32, slot: Arc<WorkerSlot>) {
  loop {
    if slot.wakeup.wait().is_err() {
      log::error!("worker {id}: wakeup wait failed, exiting");
      return;
    }
    if is_shutting_down() {
      return;
    }
    let Some(req) = slot.pending.lock().take() else {
      // Spurious wakeup from a shutdown post that raced an assignment; nothing to do.
      continue;
    };
    if let Err(err) = run_request(&req) {
      log::error!("worker {id}: request from pid {} failed: {err:#}", req.client_pid);
    }
    slot.current_client_pid.store(0, Ordering::Release);
    slot.available.store(true, Ordering::Release);
  }
}

/// Forks a child to run `req.cmd()` via `/bin/sh -c`, with stdout/stderr
/// redirected into the client's named pipe, then signals the verdict.
fn run_request(req: &Request) -> Result<()> {
  // SAFETY: fork() duplicates the calling thread only; the child immediately
  // restricts itself to async-signal-safe libc/nix calls and never returns
  // through Rust's normal unwinding machinery.
  match unsafe { fork() }.context("fork failed")? {
    ForkResult::Child => {
      run_child(req);
      unreachable!("run_child never returns");
    }
    ForkResult::Parent { child } => {
      let status = waitpid(child, None).context("waitpid failed")?;
      let success = matches!(status, WaitStatus::Exited(_, 0));
      let verdict = if success { SIG_SUCCESS } else { SIG_FAILURE };
      kill(Pid::from_raw(req.client_pid), verdict)
        .with_context(|| format!("failed to signal verdict to pid {}", req.client_pid))?;
      Ok(())
    }
  }
}

/// Runs entirely in the forked child between `fork` and `exec`. Must not
/// panic, allocate through paths that could deadlock on another thread's held
/// lock, or return: every exit path here is `_exit`, never `std::process::exit`
/// or Rust unwinding, since only the calling thread survived the fork.
fn run_child(req: &Request) -> ! {
  let pipe_name = req.pipe_name();
  let Ok(cpipe) = CString::new(pipe_name) else {
    // SAFETY: _exit is async-signal-safe and terminates immediately, no unwind.
    unsafe { libc::_exit(1) };
  };
  // SAFETY: cpipe is a valid NUL-terminated path; O_WRONLY blocks until the
  // client's reader end (opened by cmkfifo/open in the client driver) is ready.
  let fd = unsafe { libc::open(cpipe.as_ptr(), libc::O_WRONLY) };
  if fd < 0 {
    unsafe { libc::_exit(1) };
  }
  // SAFETY: fd is a valid, open descriptor; STDOUT_FILENO is the standard
  // fixed descriptor number. Only stdout is redirected to the client's pipe;
  // the command's stderr is left alone.
  unsafe {
    let _ = dup2(fd, libc::STDOUT_FILENO);
    libc::close(fd);
  }

  let Ok(shell) = CString::new("/bin/sh") else {
    unsafe { libc::_exit(1) };
  };
  let Ok(flag) = CString::new("-c") else {
    unsafe { libc::_exit(1) };
  };
  let Ok(cmd) = CString::new(req.cmd()) else {
    unsafe { libc::_exit(1) };
  };
  let _ = execvp(&shell, &[shell.clone(), flag, cmd]);
  // execvp only returns on failure.
  unsafe { libc::_exit(127) };
}
