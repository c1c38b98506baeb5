use std::io;

use clap::Parser;
use log::info;

use gradebox::runner::{execute, RunnerArgs};
use gradebox::utils::init_helper_logger;
use gradebox::{Result, RunnerExit};

fn run(args: RunnerArgs) -> Result<()> {
  let _logger = init_helper_logger()?;
  let output = execute(&args)?;
  info!(
    "Command {} finished: {:?}",
    args.cmd_id,
    output.report().return_code
  );
  // Stdout carries nothing but the frame
  let stdout = io::stdout();
  let mut lock = stdout.lock();
  output.emit(&mut lock)
}

fn main() -> RunnerExit {
  let args = RunnerArgs::parse();
  run(args).into()
}
