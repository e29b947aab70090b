//! The PID rendezvous cell (C3): a one-`pid_t`-sized shared memory region the
//! daemon publishes its process id into, and the `stop` tool reads back to
//! know which process to send `SIGTERM` to.

use anyhow::{Context, Result};

use super::shm::SharedMemory;

const CELL_LEN: usize = std::mem::size_of::<libc::pid_t>();

pub struct PidCell {
  shm: SharedMemory,
}

impl PidCell {
  pub fn store(name: &str, pid: libc::pid_t) -> Result<Self> {
    let mut shm = SharedMemory::create(name, CELL_LEN)?;
    shm.as_mut_slice().copy_from_slice(&pid.to_ne_bytes());
    Ok(Self { shm })
  }

  pub fn load(name: &str) -> Result<libc::pid_t> {
    let shm = SharedMemory::open(name)?;
    let bytes: [u8; CELL_LEN] = shm
      .as_slice()
      .try_into()
      .context("pid cell has unexpected size")?;
    Ok(libc::pid_t::from_ne_bytes(bytes))
  }

  pub fn unlink(name: &str) -> Result<()> {
    SharedMemory::unlink(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn unique_name(tag: &str) -> String {
    format!("/cmdl_test_pidcell_{tag}_{}", std::process::id())
  }

  #[test]
  fn store_then_load_round_trips_the_pid() {
    let name = unique_name("rt");
    let _cell = PidCell::store(&name, 4242).unwrap();
    assert_eq!(PidCell::load(&name).unwrap(), 4242);
  }

  #[test]
  fn load_fails_when_never_stored() {
    let name = unique_name("missing");
    assert!(PidCell::load(&name).is_err());
  }
}
