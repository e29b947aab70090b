use std::path::PathBuf;

use anyhow::Result;
use assert_cmd::Command;
use tempfile::{Builder, TempDir};

/// An isolated sandbox for one test: its own working directory (holding
/// `cmdld.conf`) and its own namespace suffix for the daemon's POSIX named
/// objects, so concurrent tests never collide on `/cmdl_shm_queue` et al.
pub struct TestEnv {
  dir: TempDir,
  namespace: String,
}

impl TestEnv {
  pub fn new() -> Self {
    let dir = Builder::new()
      .prefix("cmdl-test-")
      .tempdir_in(tmp_root())
      .expect("temp dir");
    let namespace = format!(
      "{}_{}",
      std::process::id(),
      std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
    );
    Self { dir, namespace }
  }

  pub fn path(&self) -> &std::path::Path {
    self.dir.path()
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  /// Writes `cmdld.conf` into the sandbox with the given worker/queue limits.
  pub fn write_config(&self, daemon_worker_max: u32, request_queue_max: u32) -> Result<PathBuf> {
    let path = self.path().join("cmdld.conf");
    std::fs::write(
      &path,
      format!(
        "daemon_worker_max = {daemon_worker_max}\nrequest_queue_max = {request_queue_max}\n"
      ),
    )?;
    Ok(path)
  }

  fn base_cmd(&self, bin: &str) -> Result<Command> {
    let mut cmd = Command::cargo_bin(bin)?;
    cmd.current_dir(self.path());
    cmd.env("CMDL_TEST_NAMESPACE", &self.namespace);
    Ok(cmd)
  }

  pub fn daemon(&self) -> Result<Command> {
    self.base_cmd("daemon")
  }

  pub fn client(&self) -> Result<Command> {
    self.base_cmd("client")
  }

  pub fn stop_daemon_best_effort(&self) {
    if let Ok(mut cmd) = self.daemon() {
      let _ = cmd.arg("stop").output();
    }
  }
}

impl Drop for TestEnv {
  fn drop(&mut self) {
    self.stop_daemon_best_effort();
  }
}

fn tmp_root() -> PathBuf {
  let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
  let workspace_root = manifest_dir
    .parent()
    .and_then(|p| p.parent())
    .unwrap_or(&manifest_dir)
    .to_path_buf();
  let root = workspace_root.join("target").join("test-tmp");
  let _ = std::fs::create_dir_all(&root);
  root
}
