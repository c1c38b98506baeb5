use std::process::{ExitCode, Termination};

use flexi_logger::FlexiLoggerError;
use nix::errno::Errno;
use nix::libc::STDERR_FILENO;
use nix::unistd::isatty;
use thiserror::Error;

use crate::command::CompletedCommand;

#[derive(Error, Debug)]
pub enum SandboxError {
  /// The caller asked for something the sandbox cannot do in its current state
  #[error("Sandbox Usage Error: {0}")]
  Usage(String),

  /// Strict mode only: the command exited nonzero or timed out
  #[error("Sandbox Command Error: {message}")]
  Command {
    message: String,
    completed: Box<CompletedCommand>,
  },

  /// The container engine failed or did not answer in time
  #[error("Sandbox Engine Error: {0}")]
  Engine(String),

  /// The engine client was killed after its timeout, the daemon may still finish the call
  #[error("Sandbox Engine Timeout: {0}")]
  EngineTimeout(String),

  #[error("Sandbox Setup Error: {0}")]
  Setup(String),

  /// The container could not be stopped even after reaping, it may still be running
  #[error("Sandbox Critical Error: {0}")]
  Critical(String),

  #[error("Sandbox Protocol Error: {0}")]
  Protocol(String),

  #[error("Sandbox Runner Error: {0}")]
  Runner(String),

  #[error("Sandbox Nix Error: {0}")]
  Nix(#[from] Errno),

  #[error("Sandbox File System Error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Sandbox Logger Error: {0}")]
  Logger(#[from] FlexiLoggerError),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
  pub fn usage<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Usage(msg.into())
  }

  pub fn engine<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Engine(msg.into())
  }

  pub fn engine_timeout<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::EngineTimeout(msg.into())
  }

  pub fn setup<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Setup(msg.into())
  }

  pub fn critical<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Critical(msg.into())
  }

  pub fn protocol<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Protocol(msg.into())
  }

  pub fn runner<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Runner(msg.into())
  }

  pub fn command(completed: CompletedCommand) -> SandboxError {
    let message = format!(
      "command finished with return code {:?} (timed out: {})\n{}\n{}",
      completed.return_code,
      completed.timed_out,
      String::from_utf8_lossy(&completed.stdout),
      String::from_utf8_lossy(&completed.stderr),
    );
    SandboxError::Command {
      message,
      completed: Box::new(completed),
    }
  }

  /// Critical errors need an operator: the container may be orphaned
  pub fn is_critical(&self) -> bool {
    matches!(self, SandboxError::Critical(_))
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, SandboxError::EngineTimeout(_))
  }
}

/// Process exit wrapper for the gradebox binaries
pub enum RunnerExit {
  Ok,
  Code(u8),
  Err(SandboxError),
}

impl From<Result<()>> for RunnerExit {
  fn from(result: Result<()>) -> Self {
    match result {
      Ok(()) => RunnerExit::Ok,
      Err(err) => RunnerExit::Err(err),
    }
  }
}

impl Termination for RunnerExit {
  fn report(self) -> ExitCode {
    match self {
      RunnerExit::Ok => ExitCode::SUCCESS,
      RunnerExit::Code(code) => ExitCode::from(code),
      RunnerExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDERR_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              serde_json::json!({ "ok": false, "type": prefix, "message": message }).to_string()
            }
          }
          None => text,
        };
        eprintln!("{}", text);
        ExitCode::FAILURE
      }
    }
  }
}
