//! Daemon bootstrap (C4): turning a foreground `daemon start` invocation into
//! a detached, singleton, request-serving process, and `daemon stop` into a
//! clean shutdown signal to that process.

use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::sys::stat::Mode;
use nix::unistd::{ForkResult, Pid, chdir, dup2, fork, getpid, mkfifo, setsid, unlink};

use crate::config;
use crate::ipc::{PidCell, SharedQueue, TryLockOutcome, singleton::SingletonLock};
use crate::protocol::{
  SIG_FAILURE, SIG_TERMINATE, handshake_pipe_path, pid_cell_name, queue_name, singleton_name,
};

use super::dispatcher;
use super::shutdown::install_handler;
use super::worker::WorkerPool;

const LOG_FILE: &str = "/tmp/cmdld.log";
const HANDSHAKE_TIMEOUT_SECS: u32 = 5;

static HANDSHAKE_TIMED_OUT: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigalrm(_: libc::c_int) {
  HANDSHAKE_TIMED_OUT.store(true, Ordering::Release);
}

/// Try-locks the singleton before doing anything else, so a collision is
/// reported on the starter's own stderr instead of being silently swallowed
/// after the process has already detached. Forks, lets the child daemonise
/// itself and report back over a handshake pipe, and waits in the foreground
/// until that handshake completes or times out.
pub fn start(config_path: &Path) -> Result<()> {
  let lock = match SingletonLock::try_acquire(&singleton_name())? {
    TryLockOutcome::AlreadyRunning => {
      bail!("another instance is already running");
    }
    TryLockOutcome::Acquired(lock) => lock,
  };

  let starter_pid = getpid();
  let handshake_path = handshake_pipe_path(starter_pid.as_raw());
  mkfifo(handshake_path.as_str(), Mode::from_bits_truncate(0o600))
    .context("failed to create handshake pipe")?;

  // SAFETY: the child immediately calls daemonise_and_run, which either runs
  // the dispatcher loop for the daemon's entire lifetime or exits; it never
  // returns through ordinary control flow shared with the parent.
  match unsafe { fork() }.context("fork failed")? {
    ForkResult::Parent { child: _ } => {
      // Dropping here only closes the parent's own view of the semaphore
      // mapping (sem_close); the lock itself stays held system-wide, since
      // the child inherited the same mapping across the fork and now owns
      // the value moved into daemonise_and_run below.
      drop(lock);
      await_handshake(&handshake_path)
    }
    ForkResult::Child => {
      daemonise_and_run(config_path, &handshake_path, lock);
      unreachable!("daemonise_and_run never returns");
    }
  }
}

/// Waits for the daemonised child's handshake, bounded by a 5-second alarm
/// so a child that crashes before signaling back doesn't wedge the starter.
fn await_handshake(handshake_path: &str) -> Result<()> {
  // SAFETY: the handler only stores to an AtomicBool, which is
  // async-signal-safe; no allocation, locking, or I/O happens in the handler.
  unsafe {
    signal(Signal::SIGALRM, SigHandler::Handler(handle_sigalrm))
      .context("failed to install SIGALRM handler")?;
  }
  HANDSHAKE_TIMED_OUT.store(false, Ordering::Release);
  // SAFETY: alarm() only schedules a future signal delivery.
  unsafe { libc::alarm(HANDSHAKE_TIMEOUT_SECS) };

  // The open blocks until the child opens its write end; this is the call
  // the alarm is really guarding against.
  let open_result = File::open(handshake_path);
  // SAFETY: cancels the pending alarm now that we have an answer either way.
  unsafe { libc::alarm(0) };

  let mut file = match open_result {
    Ok(file) => file,
    Err(err) => {
      let _ = unlink(handshake_path);
      if HANDSHAKE_TIMED_OUT.load(Ordering::Acquire) {
        bail!("failed to start");
      }
      return Err(err).context("failed to open handshake pipe");
    }
  };

  let mut verdict = [0u8; 1];
  let read = file
    .read(&mut verdict)
    .context("failed to read daemon handshake")?;
  let _ = unlink(handshake_path);
  if read == 0 || verdict[0] != 1 {
    bail!("failed to start");
  }
  Ok(())
}

fn signal_handshake(handshake_path: &str, success: bool) {
  if let Ok(mut file) = File::options().write(true).open(handshake_path) {
    let _ = file.write_all(&[success as u8]);
  }
}

/// Runs only in the forked child. Detaches from the controlling terminal and
/// either serves requests until shutdown or reports a startup failure back
/// to the waiting starter process.
fn daemonise_and_run(config_path: &Path, handshake_path: &str, lock: SingletonLock) -> ! {
  let _ = setsid();
  let _ = chdir("/");
  redirect_stdio();
  init_logging();

  match run_daemon(config_path, handshake_path, lock) {
    Ok(()) => std::process::exit(0),
    Err(err) => {
      log::error!("daemon: {err:#}");
      signal_handshake(handshake_path, false);
      std::process::exit(1);
    }
  }
}

fn redirect_stdio() {
  let Ok(null) = CString::new("/dev/null") else {
    return;
  };
  let Ok(log) = CString::new(LOG_FILE) else {
    return;
  };
  // SAFETY: both paths are valid NUL-terminated strings; the resulting fds
  // are immediately duped onto the standard descriptors and closed.
  unsafe {
    let devnull = libc::open(null.as_ptr(), libc::O_RDONLY);
    if devnull >= 0 {
      let _ = dup2(devnull, libc::STDIN_FILENO);
      libc::close(devnull);
    }
    let logfd = libc::open(log.as_ptr(), libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND, 0o600);
    if logfd >= 0 {
      let _ = dup2(logfd, libc::STDOUT_FILENO);
      let _ = dup2(logfd, libc::STDERR_FILENO);
      libc::close(logfd);
    }
  }
}

fn init_logging() {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_secs()
    .try_init();
}

fn run_daemon(config_path: &Path, handshake_path: &str, lock: SingletonLock) -> Result<()> {
  let cfg = config::load(config_path).context("failed to load configuration")?;
  log::info!(
    "daemon: configuration loaded, worker_max={} queue_max={}",
    cfg.daemon_worker_max,
    cfg.request_queue_max
  );

  let queue = SharedQueue::create(&queue_name(), cfg.request_queue_max)
    .context("failed to create shared request queue")?;
  let _pid_cell =
    PidCell::store(&pid_cell_name(), getpid().as_raw()).context("failed to publish daemon pid")?;
  install_handler()?;
  let pool = WorkerPool::spawn(cfg.daemon_worker_max).context("failed to spawn worker pool")?;

  log::info!("daemon: bootstrap complete, pid={}", getpid());
  signal_handshake(handshake_path, true);

  dispatcher::run(&queue, &pool)?;

  log::info!("daemon: shutting down");
  let stranded = pool.shutdown();
  for pid in stranded {
    log::warn!("daemon: failing in-flight request for pid {pid} at shutdown");
    let _ = kill(Pid::from_raw(pid), SIG_FAILURE);
  }
  SharedQueue::dispose(&queue_name()).context("failed to dispose of the request queue")?;
  PidCell::unlink(&pid_cell_name()).context("failed to remove the pid cell")?;
  lock.release().context("failed to release the singleton lock")?;
  log::info!("daemon: stopped");
  Ok(())
}

/// Try-locks the singleton first: if it's free, there's no daemon to stop, so
/// the probe's own ghost semaphore is released and this reports failure.
/// Otherwise, loads the live daemon's pid and sends it the terminate signal.
pub fn stop() -> Result<()> {
  match SingletonLock::try_acquire(&singleton_name())? {
    TryLockOutcome::Acquired(lock) => {
      lock
        .release()
        .context("failed to release probe singleton lock")?;
      bail!("no instance is running");
    }
    TryLockOutcome::AlreadyRunning => {
      let pid = PidCell::load(&pid_cell_name()).context("failed to read daemon pid")?;
      kill(Pid::from_raw(pid), SIG_TERMINATE)
        .with_context(|| format!("failed to signal daemon process {pid}"))?;
      Ok(())
    }
  }
}
