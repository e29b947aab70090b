//! POSIX shared memory region wrapper. `nix::sys::mman` covers `mmap`/`munmap`
//! but not `shm_open`/`shm_unlink`, so this goes through `libc` directly for
//! those two calls and leans on `nix` for the mapping itself.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;

use anyhow::{Context, Result};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use nix::sys::stat::fstat;
use nix::unistd::ftruncate;

/// A named POSIX shared memory mapping. `create` establishes the region's size;
/// `open` discovers it via `fstat`, so a client never needs to know the queue's
/// capacity out of band, only agree on the request slot layout at compile time.
pub struct SharedMemory {
  ptr: NonNull<u8>,
  len: usize,
  name: String,
  owner: bool,
}

// SAFETY: the mapping is backed by kernel shared memory; concurrent access from
// multiple processes is the whole point, and callers are responsible for
// synchronizing writes (the queue does this via its semaphores).
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
  /// Creates (or re-creates) a shared memory region of exactly `len` bytes.
  pub fn create(name: &str, len: usize) -> Result<Self> {
    let fd = shm_open(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)
      .or_else(|_| {
        // A stale region from a crashed prior daemon run; replace it.
        shm_unlink(name).ok();
        shm_open(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)
      })
      .with_context(|| format!("shm_open({name}) for create failed"))?;
    ftruncate(&fd, len as libc::off_t)
      .with_context(|| format!("ftruncate({name}, {len}) failed"))?;
    let ptr = map(&fd, len)?;
    Ok(Self {
      ptr,
      len,
      name: name.to_string(),
      owner: true,
    })
  }

  /// Opens an existing shared memory region, discovering its size via `fstat`.
  pub fn open(name: &str) -> Result<Self> {
    let fd =
      shm_open(name, libc::O_RDWR).with_context(|| format!("shm_open({name}) for open failed"))?;
    let st = fstat(fd.as_raw_fd()).with_context(|| format!("fstat({name}) failed"))?;
    let len = st.st_size as usize;
    let ptr = map(&fd, len)?;
    Ok(Self {
      ptr,
      len,
      name: name.to_string(),
      owner: false,
    })
  }

  pub fn as_ptr(&self) -> *mut u8 {
    self.ptr.as_ptr()
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn as_slice(&self) -> &[u8] {
    // SAFETY: ptr is valid for len bytes for the lifetime of self.
    unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    // SAFETY: ptr is valid for len bytes for the lifetime of self.
    unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
  }

  /// Removes the name from the system. Only the daemon (the creator) does this,
  /// on shutdown; a client never unlinks the queue it opened.
  pub fn unlink(name: &str) -> Result<()> {
    shm_unlink(name)
  }
}

impl Drop for SharedMemory {
  fn drop(&mut self) {
    // SAFETY: ptr/len describe the live mapping created in create()/open().
    unsafe {
      let _ = munmap(self.ptr.cast(), self.len);
    }
    if self.owner {
      let _ = shm_unlink(&self.name);
    }
  }
}

fn shm_open(name: &str, flags: libc::c_int) -> Result<OwnedFd> {
  use std::os::fd::FromRawFd;
  let cname = CString::new(name).context("shared memory name contains a NUL byte")?;
  // SAFETY: cname is a valid NUL-terminated string for the duration of the call.
  let fd = unsafe { libc::shm_open(cname.as_ptr(), flags, 0o600 as libc::mode_t) };
  if fd < 0 {
    return Err(std::io::Error::last_os_error()).context("shm_open failed");
  }
  // SAFETY: fd is a newly-opened, valid, owned file descriptor.
  Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn shm_unlink(name: &str) -> Result<()> {
  let cname = CString::new(name).context("shared memory name contains a NUL byte")?;
  // SAFETY: cname is a valid NUL-terminated string for the duration of the call.
  let rc = unsafe { libc::shm_unlink(cname.as_ptr()) };
  if rc != 0 {
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOENT) {
      return Ok(());
    }
    return Err(err).with_context(|| format!("shm_unlink({name}) failed"));
  }
  Ok(())
}

fn map(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>> {
  // SAFETY: fd is a valid shared-memory-backed descriptor sized to at least len.
  let ptr = unsafe {
    mmap(
      None,
      std::num::NonZeroUsize::new(len).context("shared memory region must be non-empty")?,
      ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
      MapFlags::MAP_SHARED,
      fd,
      0,
    )
  }
  .context("mmap failed")?;
  Ok(ptr.cast())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn unique_name(tag: &str) -> String {
    format!("/cmdl_test_{tag}_{}", std::process::id())
  }

  #[test]
  fn create_then_open_sees_same_bytes() {
    let name = unique_name("shm_rt");
    {
      let mut shm = SharedMemory::create(&name, 64).unwrap();
      shm.as_mut_slice()[0] = 0xAB;
    }
    // create()'s Drop unlinked the name; recreate to simulate daemon-then-client.
    let mut shm = SharedMemory::create(&name, 64).unwrap();
    shm.as_mut_slice()[0] = 0xCD;
    let opened = SharedMemory::open(&name).unwrap();
    assert_eq!(opened.len(), 64);
    assert_eq!(opened.as_slice()[0], 0xCD);
  }

  #[test]
  fn open_discovers_size_via_fstat() {
    let name = unique_name("shm_size");
    let _shm = SharedMemory::create(&name, 128).unwrap();
    let opened = SharedMemory::open(&name).unwrap();
    assert_eq!(opened.len(), 128);
  }

  #[test]
  fn open_fails_when_not_created() {
    let name = unique_name("shm_missing");
    assert!(SharedMemory::open(&name).is_err());
  }
}
