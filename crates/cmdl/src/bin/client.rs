use std::process::ExitCode;

use cmdl::client;

fn main() -> ExitCode {
  let mut args = std::env::args();
  let _argv0 = args.next();
  let Some(cmd) = args.next() else {
    println!("Usage: client '<command>'");
    return ExitCode::FAILURE;
  };
  if args.next().is_some() {
    println!("Usage: client '<command>'");
    return ExitCode::FAILURE;
  }

  match client::run(&cmd) {
    // run() only returns on error; success/failure verdicts exit the process
    // directly from their signal handlers.
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      eprintln!("client: {err:#}");
      ExitCode::FAILURE
    }
  }
}
