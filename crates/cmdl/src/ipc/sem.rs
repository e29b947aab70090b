//! Thin safe wrappers around POSIX semaphores. `nix` does not expose the named
//! (`sem_open`) family, so these go straight to `libc`, matching the level the
//! daemon's other raw-POSIX pieces (shared memory) operate at.

use std::ffi::CString;
use std::mem::MaybeUninit;

use anyhow::{Context, Result};

/// A semaphore identified by a `/name` in the kernel's POSIX IPC namespace,
/// shared between unrelated processes (the client and the daemon).
pub struct NamedSemaphore {
  sem: *mut libc::sem_t,
  name: String,
}

// SAFETY: `sem_t` obtained via `sem_open` is safe to share across threads; all
// operations on it are already synchronized by the kernel.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
  /// Opens (creating if absent) a named semaphore initialised to `initial_value`.
  pub fn create(name: &str, initial_value: u32) -> Result<Self> {
    let cname = CString::new(name).context("semaphore name contains a NUL byte")?;
    // SAFETY: cname is a valid NUL-terminated string for the duration of the call.
    let sem = unsafe {
      libc::sem_open(
        cname.as_ptr(),
        libc::O_CREAT,
        0o600 as libc::mode_t,
        initial_value,
      )
    };
    if sem == libc::SEM_FAILED {
      return Err(std::io::Error::last_os_error())
        .with_context(|| format!("sem_open({name}) failed"));
    }
    Ok(Self {
      sem,
      name: name.to_string(),
    })
  }

  /// Opens an existing named semaphore, failing if it has not been created yet.
  pub fn open(name: &str) -> Result<Self> {
    let cname = CString::new(name).context("semaphore name contains a NUL byte")?;
    // SAFETY: cname is a valid NUL-terminated string for the duration of the call.
    let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
    if sem == libc::SEM_FAILED {
      return Err(std::io::Error::last_os_error())
        .with_context(|| format!("sem_open({name}) failed: not found"));
    }
    Ok(Self {
      sem,
      name: name.to_string(),
    })
  }

  /// Blocks until the semaphore can be decremented, retrying on `EINTR`.
  pub fn wait(&self) -> Result<()> {
    loop {
      // SAFETY: self.sem is a valid sem_t* for the lifetime of self.
      let rc = unsafe { libc::sem_wait(self.sem) };
      if rc == 0 {
        return Ok(());
      }
      let err = std::io::Error::last_os_error();
      if err.raw_os_error() == Some(libc::EINTR) {
        continue;
      }
      return Err(err).with_context(|| format!("sem_wait({})", self.name));
    }
  }

  /// Blocks until the semaphore can be decremented, but returns `Ok(false)`
  /// instead of retrying when interrupted by a signal. Used by the dispatcher
  /// so a delivered `SIGTERM` can break it out of an otherwise indefinite wait.
  pub fn wait_interruptible(&self) -> Result<bool> {
    // SAFETY: self.sem is a valid sem_t* for the lifetime of self.
    let rc = unsafe { libc::sem_wait(self.sem) };
    if rc == 0 {
      return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINTR) {
      return Ok(false);
    }
    Err(err).with_context(|| format!("sem_wait({})", self.name))
  }

  /// Non-blocking decrement. Returns `Ok(false)` instead of erroring when the
  /// semaphore is already at zero.
  pub fn try_wait(&self) -> Result<bool> {
    // SAFETY: self.sem is a valid sem_t* for the lifetime of self.
    let rc = unsafe { libc::sem_trywait(self.sem) };
    if rc == 0 {
      return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EAGAIN) {
      return Ok(false);
    }
    Err(err).with_context(|| format!("sem_trywait({})", self.name))
  }

  pub fn post(&self) -> Result<()> {
    // SAFETY: self.sem is a valid sem_t* for the lifetime of self.
    let rc = unsafe { libc::sem_post(self.sem) };
    if rc != 0 {
      return Err(std::io::Error::last_os_error())
        .with_context(|| format!("sem_post({})", self.name));
    }
    Ok(())
  }

  /// Removes the name from the system, without affecting already-open handles.
  pub fn unlink(name: &str) -> Result<()> {
    let cname = CString::new(name).context("semaphore name contains a NUL byte")?;
    // SAFETY: cname is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::sem_unlink(cname.as_ptr()) };
    if rc != 0 {
      let err = std::io::Error::last_os_error();
      if err.raw_os_error() == Some(libc::ENOENT) {
        return Ok(());
      }
      return Err(err).with_context(|| format!("sem_unlink({name})"));
    }
    Ok(())
  }
}

impl Drop for NamedSemaphore {
  fn drop(&mut self) {
    // SAFETY: self.sem was returned by a successful sem_open and has not been closed yet.
    unsafe {
      libc::sem_close(self.sem);
    }
  }
}

/// An unnamed, process-private semaphore (`pshared = 0`), used to wake a single
/// worker thread from its idle wait without going through the kernel's named
/// IPC namespace.
pub struct PrivateSemaphore {
  sem: libc::sem_t,
}

impl PrivateSemaphore {
  pub fn new(initial_value: u32) -> Result<Self> {
    let mut sem = MaybeUninit::<libc::sem_t>::uninit();
    // SAFETY: sem is freshly allocated, uninitialized memory of the correct size.
    let rc = unsafe { libc::sem_init(sem.as_mut_ptr(), 0, initial_value) };
    if rc != 0 {
      return Err(std::io::Error::last_os_error()).context("sem_init failed");
    }
    // SAFETY: sem_init succeeded, so sem is now initialized.
    Ok(Self {
      sem: unsafe { sem.assume_init() },
    })
  }

  pub fn wait(&self) -> Result<()> {
    loop {
      // SAFETY: self.sem was initialized by sem_init and not yet destroyed.
      let rc = unsafe { libc::sem_wait(&self.sem as *const _ as *mut _) };
      if rc == 0 {
        return Ok(());
      }
      let err = std::io::Error::last_os_error();
      if err.raw_os_error() == Some(libc::EINTR) {
        continue;
      }
      return Err(err).context("sem_wait (private) failed");
    }
  }

  pub fn post(&self) -> Result<()> {
    // SAFETY: self.sem was initialized by sem_init and not yet destroyed.
    let rc = unsafe { libc::sem_post(&self.sem as *const _ as *mut _) };
    if rc != 0 {
      return Err(std::io::Error::last_os_error()).context("sem_post (private) failed");
    }
    Ok(())
  }
}

impl Drop for PrivateSemaphore {
  fn drop(&mut self) {
    // SAFETY: self.sem was initialized by sem_init in new() and is owned by self.
    unsafe {
      libc::sem_destroy(&mut self.sem);
    }
  }
}
