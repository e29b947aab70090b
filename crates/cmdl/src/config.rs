use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

const MIN_DAEMON_WORKER_MAX: u32 = 1;
const MAX_DAEMON_WORKER_MAX: u32 = 64;
const MIN_REQUEST_QUEUE_MAX: u32 = 1;
const MAX_REQUEST_QUEUE_MAX: u32 = 256;

/// Raw TOML shape. Both fields are mandatory; a missing key is a hard error.
#[derive(Debug, Deserialize)]
struct RawConfig {
  daemon_worker_max: u32,
  request_queue_max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  pub daemon_worker_max: u32,
  pub request_queue_max: u32,
}

impl Config {
  fn from_raw(raw: RawConfig) -> Result<Self> {
    if !(MIN_DAEMON_WORKER_MAX..=MAX_DAEMON_WORKER_MAX).contains(&raw.daemon_worker_max) {
      bail!(
        "daemon_worker_max must be between {MIN_DAEMON_WORKER_MAX} and {MAX_DAEMON_WORKER_MAX}, got {}",
        raw.daemon_worker_max
      );
    }
    if !(MIN_REQUEST_QUEUE_MAX..=MAX_REQUEST_QUEUE_MAX).contains(&raw.request_queue_max) {
      bail!(
        "request_queue_max must be between {MIN_REQUEST_QUEUE_MAX} and {MAX_REQUEST_QUEUE_MAX}, got {}",
        raw.request_queue_max
      );
    }
    Ok(Self {
      daemon_worker_max: raw.daemon_worker_max,
      request_queue_max: raw.request_queue_max,
    })
  }
}

/// Loads and validates `cmdld.conf`, relative to the daemon starter's working directory.
///
/// # Errors
/// Returns an error if the file is missing, is not valid TOML, or any field is out of range.
pub fn load(path: &Path) -> Result<Config> {
  let data = fs::read_to_string(path)
    .with_context(|| format!("failed to read configuration file {}", path.display()))?;
  let raw: RawConfig = toml::from_str(&data)
    .with_context(|| format!("invalid configuration in {}", path.display()))?;
  Config::from_raw(raw).with_context(|| format!("invalid configuration in {}", path.display()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn load_parses_valid_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cmdld.conf");
    fs::write(&path, "daemon_worker_max = 4\nrequest_queue_max = 16\n").unwrap();

    let cfg = load(&path).unwrap();
    assert_eq!(cfg.daemon_worker_max, 4);
    assert_eq!(cfg.request_queue_max, 16);
  }

  #[test]
  fn load_fails_on_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("does-not-exist.conf");
    let err = load(&path).unwrap_err();
    assert!(err.to_string().contains("failed to read"));
  }

  #[test]
  fn load_fails_on_malformed_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cmdld.conf");
    fs::write(&path, "not valid toml {{{").unwrap();
    let err = load(&path).unwrap_err();
    assert!(err.to_string().contains("invalid configuration"));
  }

  #[test]
  fn load_rejects_worker_max_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cmdld.conf");
    fs::write(&path, "daemon_worker_max = 0\nrequest_queue_max = 16\n").unwrap();
    let err = load(&path).unwrap_err();
    assert!(err.to_string().contains("daemon_worker_max"));
  }

  #[test]
  fn load_rejects_queue_max_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cmdld.conf");
    fs::write(&path, "daemon_worker_max = 4\nrequest_queue_max = 257\n").unwrap();
    let err = load(&path).unwrap_err();
    assert!(err.to_string().contains("request_queue_max"));
  }

  #[test]
  fn load_rejects_missing_field() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cmdld.conf");
    fs::write(&path, "daemon_worker_max = 4\n").unwrap();
    let err = load(&path).unwrap_err();
    assert!(err.to_string().contains("invalid configuration"));
  }

  #[test]
  fn from_raw_accepts_boundary_values() {
    let cfg = Config::from_raw(RawConfig {
      daemon_worker_max: 1,
      request_queue_max: 256,
    })
    .unwrap();
    assert_eq!(cfg.daemon_worker_max, 1);
    assert_eq!(cfg.request_queue_max, 256);
  }
}
