use std::path::Path;
use std::process::ExitCode;

use cmdl::daemon;
use cmdl::log_error;

const DEFAULT_CONFIG_PATH: &str = "cmdld.conf";

fn main() -> ExitCode {
  let mut args = std::env::args();
  let _argv0 = args.next();
  let Some(subcommand) = args.next() else {
    println!("Usage: daemon start | stop");
    return ExitCode::FAILURE;
  };

  let result = match subcommand.as_str() {
    "start" => {
      let config_path = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
      daemon::start(Path::new(&config_path))
    }
    "stop" => daemon::stop(),
    _ => {
      println!("Usage: daemon start | stop");
      return ExitCode::FAILURE;
    }
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      log_error!("daemon: {err:#}");
      ExitCode::FAILURE
    }
  }
}
