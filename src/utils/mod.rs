use std::env;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use flexi_logger::{DeferredNow, Logger, LoggerHandle};
use log::Record;

use crate::error::Result;

/// Log spec for the in-container helpers, stdout is never used for logs there
pub const HELPER_LOG_ENV: &str = "GRADEBOX_LOG";

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Container sandbox-1 started```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> std::result::Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

/// Logger for `gradebox-runner` and `gradebox-reap`: stderr only
pub fn init_helper_logger() -> Result<LoggerHandle> {
  let spec = env::var(HELPER_LOG_ENV).unwrap_or_else(|_| "warn".to_string());
  let handle = Logger::try_with_str(spec)?
    .log_to_stderr()
    .format(default_format)
    .start()?;
  Ok(handle)
}

/// Exit code of a finished process, -N when it was killed by signal N
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
  match status.code() {
    Some(code) => code,
    None => -status.signal().unwrap_or(0),
  }
}

#[cfg(test)]
mod tests {
  use std::process::Command;

  use super::*;

  #[test]
  fn it_should_negate_signals() {
    let status = Command::new("sh").args(["-c", "exit 7"]).status().unwrap();
    assert_eq!(exit_code(status), 7);
    let status = Command::new("sh").args(["-c", "kill -TERM $$"]).status().unwrap();
    assert_eq!(exit_code(status), -15);
  }
}
