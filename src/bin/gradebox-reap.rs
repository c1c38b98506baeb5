use std::time::Duration;

use clap::Parser;

use gradebox::reaper::{HostReaper, Reaper, DEFAULT_REAP_GRACE};
use gradebox::utils::init_helper_logger;
use gradebox::RunnerExit;

#[derive(Parser, Debug)]
#[command(name = "gradebox-reap", version, about = "Kill the descendants of the process matching a token")]
struct Cli {
  #[arg(long, default_value_t = DEFAULT_REAP_GRACE.as_secs(), help = "Seconds between SIGTERM and SIGKILL")]
  grace: u64,

  #[arg(help = "Token contained in the command line of the parent process")]
  token: String,
}

fn main() -> RunnerExit {
  let cli = Cli::parse();
  let _logger = match init_helper_logger() {
    Ok(handle) => handle,
    Err(err) => return RunnerExit::Err(err),
  };

  // Failures are logged by the reaper, the caller only needs the attempt
  HostReaper::new()
    .grace(Duration::from_secs(cli.grace))
    .reap(&cli.token);
  RunnerExit::Ok
}
