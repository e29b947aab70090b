//! The shared request queue (C1): a bounded ring buffer of `Request` slots
//! living in a POSIX shared memory region, with mutual exclusion and blocking
//! space/item accounting provided by three named semaphores.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result, bail};

use super::sem::NamedSemaphore;
use super::shm::SharedMemory;
use crate::protocol::Request;

const SLOT_SIZE: usize = std::mem::size_of::<Request>();

#[repr(C)]
struct Header {
  capacity: AtomicU32,
  head: AtomicU32,
  tail: AtomicU32,
  length: AtomicU32,
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

/// A bounded multi-producer multi-consumer queue of `Request`s, shared between
/// the client processes (producers) and the daemon's dispatcher (consumer).
pub struct SharedQueue {
  shm: SharedMemory,
  mutex: NamedSemaphore,
  not_full: NamedSemaphore,
  not_empty: NamedSemaphore,
}

impl SharedQueue {
  /// Creates the queue's backing objects. Called once, by the daemon, during
  /// bootstrap (C4).
  pub fn create(name: &str, capacity: u32) -> Result<Self> {
    if capacity == 0 {
      bail!("queue capacity must be at least 1");
    }
    let region_len = HEADER_SIZE + capacity as usize * SLOT_SIZE;
    let mut shm = SharedMemory::create(name, region_len)?;
    // SAFETY: the region was just created with exactly HEADER_SIZE + capacity *
    // SLOT_SIZE bytes, large enough to hold a Header at offset 0.
    let header = unsafe { &mut *shm.as_mut_slice().as_mut_ptr().cast::<Header>() };
    header.capacity.store(capacity, Ordering::Relaxed);
    header.head.store(0, Ordering::Relaxed);
    header.tail.store(0, Ordering::Relaxed);
    header.length.store(0, Ordering::Relaxed);

    let mutex = NamedSemaphore::create(&mutex_name(name), 1)?;
    let not_full = NamedSemaphore::create(&not_full_name(name), capacity)?;
    let not_empty = NamedSemaphore::create(&not_empty_name(name), 0)?;
    Ok(Self {
      shm,
      mutex,
      not_full,
      not_empty,
    })
  }

  /// Opens a queue previously created by the daemon. Called by every client.
  pub fn open(name: &str) -> Result<Self> {
    let shm = SharedMemory::open(name)?;
    if shm.len() < HEADER_SIZE {
      bail!("shared queue region {name} is smaller than a header, daemon may be unhealthy");
    }
    let mutex = NamedSemaphore::open(&mutex_name(name))
      .context("request queue mutex not found; is the daemon running?")?;
    let not_full = NamedSemaphore::open(&not_full_name(name))?;
    let not_empty = NamedSemaphore::open(&not_empty_name(name))?;
    Ok(Self {
      shm,
      mutex,
      not_full,
      not_empty,
    })
  }

  fn header(&self) -> &Header {
    // SAFETY: the region always holds a valid Header at offset 0, written by create().
    unsafe { &*self.shm.as_slice().as_ptr().cast::<Header>() }
  }

  fn capacity(&self) -> u32 {
    self.header().capacity.load(Ordering::Relaxed)
  }

  pub fn len(&self) -> u32 {
    self.header().length.load(Ordering::Relaxed)
  }

  fn slot_ptr(&self, index: u32) -> *mut u8 {
    // SAFETY: index is always < capacity, and the region reserves capacity *
    // SLOT_SIZE bytes past the header for exactly this purpose.
    unsafe {
      self
        .shm
        .as_ptr()
        .add(HEADER_SIZE + index as usize * SLOT_SIZE)
    }
  }

  /// Blocks until there is room, then appends `req` at the tail.
  pub fn enqueue(&self, req: &Request) -> Result<()> {
    self.not_full.wait()?;
    self.mutex.wait()?;
    let header = self.header();
    let tail = header.tail.load(Ordering::Relaxed);
    // SAFETY: slot_ptr(tail) points to a writable SLOT_SIZE region and
    // req.as_bytes() yields exactly SLOT_SIZE bytes.
    unsafe {
      std::ptr::copy_nonoverlapping(req.as_bytes().as_ptr(), self.slot_ptr(tail), SLOT_SIZE);
    }
    header
      .tail
      .store((tail + 1) % self.capacity(), Ordering::Relaxed);
    header.length.fetch_add(1, Ordering::Relaxed);
    self.mutex.post()?;
    self.not_empty.post()?;
    Ok(())
  }

  /// Blocks until an item is available, then removes and returns it from the head.
  pub fn dequeue(&self) -> Result<Request> {
    self.not_empty.wait()?;
    let req = self.dequeue_locked()?;
    self.not_full.post()?;
    Ok(req)
  }

  /// Like `dequeue`, but a signal delivered while blocked returns `Ok(None)`
  /// instead of retrying, so the dispatcher's shutdown path can observe it.
  pub fn dequeue_interruptible(&self) -> Result<Option<Request>> {
    if !self.not_empty.wait_interruptible()? {
      return Ok(None);
    }
    let req = self.dequeue_locked()?;
    self.not_full.post()?;
    Ok(Some(req))
  }

  fn dequeue_locked(&self) -> Result<Request> {
    self.mutex.wait()?;
    let header = self.header();
    let head = header.head.load(Ordering::Relaxed);
    // SAFETY: slot_ptr(head) points to a readable SLOT_SIZE region previously
    // written by enqueue.
    let bytes = unsafe { std::slice::from_raw_parts(self.slot_ptr(head), SLOT_SIZE) };
    let req = unsafe { Request::from_bytes(bytes) };
    header
      .head
      .store((head + 1) % self.capacity(), Ordering::Relaxed);
    header.length.fetch_sub(1, Ordering::Relaxed);
    self.mutex.post()?;
    Ok(req)
  }

  /// Iterates slots from `head` to `tail` (wrapping), calling `f` on each in
  /// order and stopping at the first non-zero return (which becomes the
  /// result). Not synchronised against concurrent mutation; intended for
  /// debug inspection only.
  pub fn apply<F: FnMut(&Request) -> i32>(&self, mut f: F) -> i32 {
    let header = self.header();
    let capacity = self.capacity();
    let length = header.length.load(Ordering::Relaxed);
    let mut index = header.head.load(Ordering::Relaxed);
    for _ in 0..length {
      // SAFETY: index stays within 0..capacity, and every slot up to
      // `length` past `head` was written by a completed enqueue.
      let bytes = unsafe { std::slice::from_raw_parts(self.slot_ptr(index), SLOT_SIZE) };
      let req = unsafe { Request::from_bytes(bytes) };
      let result = f(&req);
      if result != 0 {
        return result;
      }
      index = (index + 1) % capacity;
    }
    0
  }

  /// Removes the queue's named objects from the system. Only the daemon calls
  /// this, as part of shutdown (C8); the `SharedMemory`'s own `Drop` handles
  /// the shm unlink since it was created with `owner = true`.
  pub fn dispose(name: &str) -> Result<()> {
    NamedSemaphore::unlink(&mutex_name(name))?;
    NamedSemaphore::unlink(&not_full_name(name))?;
    NamedSemaphore::unlink(&not_empty_name(name))?;
    SharedMemory::unlink(name)
  }
}

fn mutex_name(base: &str) -> String {
  format!("{base}_shm")
}

fn not_full_name(base: &str) -> String {
  format!("{base}_not_full")
}

fn not_empty_name(base: &str) -> String {
  format!("{base}_not_empty")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn unique_name(tag: &str) -> String {
    format!("/cmdl_test_queue_{tag}_{}", std::process::id())
  }

  #[test]
  fn enqueue_then_dequeue_preserves_fifo_order() {
    let name = unique_name("fifo");
    let q = SharedQueue::create(&name, 4).unwrap();
    q.enqueue(&Request::new("first", "/tmp/p1", 1).unwrap())
      .unwrap();
    q.enqueue(&Request::new("second", "/tmp/p2", 2).unwrap())
      .unwrap();
    assert_eq!(q.len(), 2);
    assert_eq!(q.dequeue().unwrap().cmd(), "first");
    assert_eq!(q.dequeue().unwrap().cmd(), "second");
    assert_eq!(q.len(), 0);
    SharedQueue::dispose(&name).unwrap();
  }

  #[test]
  fn wraps_around_the_ring_buffer() {
    let name = unique_name("wrap");
    let q = SharedQueue::create(&name, 2).unwrap();
    for i in 0..10 {
      q.enqueue(&Request::new(&format!("cmd{i}"), "/tmp/p", i).unwrap())
        .unwrap();
      assert_eq!(q.dequeue().unwrap().cmd(), format!("cmd{i}"));
    }
    SharedQueue::dispose(&name).unwrap();
  }

  #[test]
  fn apply_stops_at_first_nonzero_return() {
    let name = unique_name("apply_hit");
    let q = SharedQueue::create(&name, 4).unwrap();
    q.enqueue(&Request::new("a", "/tmp/p", 1).unwrap()).unwrap();
    q.enqueue(&Request::new("b", "/tmp/p", 2).unwrap()).unwrap();
    q.enqueue(&Request::new("c", "/tmp/p", 3).unwrap()).unwrap();

    let mut visited = Vec::new();
    let result = q.apply(|req| {
      visited.push(req.cmd().to_string());
      if req.cmd() == "b" { 7 } else { 0 }
    });
    assert_eq!(result, 7);
    assert_eq!(visited, vec!["a", "b"]);
    SharedQueue::dispose(&name).unwrap();
  }

  #[test]
  fn apply_returns_zero_when_every_call_returns_zero() {
    let name = unique_name("apply_miss");
    let q = SharedQueue::create(&name, 4).unwrap();
    q.enqueue(&Request::new("a", "/tmp/p", 1).unwrap()).unwrap();
    q.enqueue(&Request::new("b", "/tmp/p", 2).unwrap()).unwrap();

    let mut count = 0;
    let result = q.apply(|_| {
      count += 1;
      0
    });
    assert_eq!(result, 0);
    assert_eq!(count, 2);
    SharedQueue::dispose(&name).unwrap();
  }

  #[test]
  fn apply_on_an_empty_queue_never_calls_f() {
    let name = unique_name("apply_empty");
    let q = SharedQueue::create(&name, 4).unwrap();
    let result = q.apply(|_| 1);
    assert_eq!(result, 0);
    SharedQueue::dispose(&name).unwrap();
  }

  #[test]
  fn open_sees_items_enqueued_by_creator() {
    let name = unique_name("open");
    let q = SharedQueue::create(&name, 4).unwrap();
    q.enqueue(&Request::new("hello", "/tmp/p", 5).unwrap())
      .unwrap();
    let opened = SharedQueue::open(&name).unwrap();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened.dequeue().unwrap().cmd(), "hello");
    SharedQueue::dispose(&name).unwrap();
  }

  #[test]
  fn create_rejects_zero_capacity() {
    let name = unique_name("zero");
    assert!(SharedQueue::create(&name, 0).is_err());
  }

  #[test]
  fn open_fails_without_a_prior_create() {
    let name = unique_name("missing");
    assert!(SharedQueue::open(&name).is_err());
  }
}
