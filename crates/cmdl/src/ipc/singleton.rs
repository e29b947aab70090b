//! The daemon singleton lock (C2): a named semaphore used purely as a
//! try-lock, preventing two daemon processes from running at once. Unlike the
//! request queue's semaphores, this one is never `post`ed back by the
//! acquirer; only an explicit `release` (at shutdown) or process death
//! implicitly releases it for a fresh `sem_open(O_CREAT)` in a later run to
//! recreate.

use anyhow::Result;

use super::sem::NamedSemaphore;

pub enum TryLockOutcome {
  Acquired(SingletonLock),
  AlreadyRunning,
}

pub struct SingletonLock {
  sem: NamedSemaphore,
  name: String,
}

impl SingletonLock {
  /// Attempts to acquire the lock, creating the semaphore if this is the
  /// first daemon to ever run on this host.
  pub fn try_acquire(name: &str) -> Result<TryLockOutcome> {
    let sem = NamedSemaphore::create(name, 1)?;
    if sem.try_wait()? {
      Ok(TryLockOutcome::Acquired(SingletonLock {
        sem,
        name: name.to_string(),
      }))
    } else {
      Ok(TryLockOutcome::AlreadyRunning)
    }
  }

  /// Releases the lock and removes its name, allowing a future daemon to
  /// acquire a fresh semaphore rather than inheriting this one's state.
  pub fn release(self) -> Result<()> {
    NamedSemaphore::unlink(&self.name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn unique_name(tag: &str) -> String {
    format!("/cmdl_test_singleton_{tag}_{}", std::process::id())
  }

  #[test]
  fn first_acquire_succeeds_second_is_rejected() {
    let name = unique_name("exclusive");
    let lock = match SingletonLock::try_acquire(&name).unwrap() {
      TryLockOutcome::Acquired(lock) => lock,
      TryLockOutcome::AlreadyRunning => panic!("expected to acquire an unheld lock"),
    };
    match SingletonLock::try_acquire(&name).unwrap() {
      TryLockOutcome::Acquired(_) => panic!("expected the lock to already be held"),
      TryLockOutcome::AlreadyRunning => {}
    }
    lock.release().unwrap();
  }

  #[test]
  fn release_allows_a_later_acquire() {
    let name = unique_name("reacquire");
    let lock = match SingletonLock::try_acquire(&name).unwrap() {
      TryLockOutcome::Acquired(lock) => lock,
      TryLockOutcome::AlreadyRunning => panic!("expected to acquire an unheld lock"),
    };
    lock.release().unwrap();
    match SingletonLock::try_acquire(&name).unwrap() {
      TryLockOutcome::Acquired(lock) => lock.release().unwrap(),
      TryLockOutcome::AlreadyRunning => panic!("expected the lock to be free after release"),
    }
  }
}
