//! End-to-end scenarios driving the real `daemon` and `client` binaries,
//! covering the request/response round trip, failure propagation, rejection
//! when the daemon isn't running, and the singleton lock.

mod common;

use std::thread;
use std::time::Duration;

use predicates::str::contains;
use serial_test::serial;

use common::test_env::TestEnv;

fn wait_for_daemon_ready() {
  // The `daemon start` foreground invocation already blocks on the handshake
  // pipe until the background process reports itself bootstrapped, so by the
  // time it returns the queue exists; this just gives the OS a moment to
  // finish scheduling the detached process before the next command runs.
  thread::sleep(Duration::from_millis(50));
}

#[test]
#[serial]
fn client_streams_successful_command_output() {
  let env = TestEnv::new();
  env.write_config(4, 16).unwrap();

  env.daemon().unwrap().arg("start").assert().success();
  wait_for_daemon_ready();

  env
    .client()
    .unwrap()
    .arg("echo hello")
    .assert()
    .success()
    .stdout(contains("hello"));

  env.daemon().unwrap().arg("stop").assert().success();
}

#[test]
#[serial]
fn client_reports_failure_for_a_failing_command() {
  let env = TestEnv::new();
  env.write_config(4, 16).unwrap();

  env.daemon().unwrap().arg("start").assert().success();
  wait_for_daemon_ready();

  env
    .client()
    .unwrap()
    .arg("exit 1")
    .assert()
    .failure();

  env.daemon().unwrap().arg("stop").assert().success();
}

#[test]
#[serial]
fn client_errors_cleanly_when_no_daemon_is_running() {
  let env = TestEnv::new();
  env
    .client()
    .unwrap()
    .arg("echo hello")
    .assert()
    .failure()
    .stderr(contains("failed to reach daemon"));
}

#[test]
#[serial]
fn second_daemon_start_is_rejected_while_one_is_running() {
  let env = TestEnv::new();
  env.write_config(4, 16).unwrap();

  env.daemon().unwrap().arg("start").assert().success();
  wait_for_daemon_ready();

  env.daemon().unwrap().arg("start").assert().failure();

  env.daemon().unwrap().arg("stop").assert().success();
}

#[test]
#[serial]
fn client_without_a_command_prints_usage_and_fails() {
  let env = TestEnv::new();
  env
    .client()
    .unwrap()
    .assert()
    .failure()
    .stdout(contains("Usage: client"));
}

#[test]
#[serial]
fn daemon_with_unknown_subcommand_prints_usage_and_fails() {
  let env = TestEnv::new();
  env
    .daemon()
    .unwrap()
    .arg("bogus")
    .assert()
    .failure()
    .stdout(contains("Usage: daemon"));
}
