use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Everything fixed at container creation
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
  pub name: String,
  pub image: String,
  pub env: BTreeMap<String, String>,
  pub pids_limit: u64,
  pub memory_limit: String,
  pub cpu_core_limit: Option<f64>,
  pub allow_network_access: bool,
  /// Replaces the image's entrypoint and command
  pub command: Vec<String>,
}

/// One process to start inside a running container
#[derive(Debug)]
pub struct ExecRequest {
  pub argv: Vec<String>,
  /// `None` means an empty stdin
  pub stdin: Option<File>,
  /// Directory inside the container, the image's default when `None`
  pub working_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
  /// Exit code, or -N when killed by signal N
  pub status: i32,
  pub stdout: Vec<u8>,
  pub stderr: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
  Created,
  Running,
  Paused,
  Restarting,
  Exited,
  Dead,
  Missing,
  Other(String),
}

impl ExecRequest {
  pub fn new(argv: Vec<String>) -> Self {
    ExecRequest {
      argv,
      stdin: None,
      working_dir: None,
    }
  }

  pub fn working_dir<WS: Into<String>>(mut self, dir: WS) -> Self {
    self.working_dir = Some(dir.into());
    self
  }

  pub fn stdin(mut self, file: Option<File>) -> Self {
    self.stdin = file;
    self
  }
}

impl ContainerStatus {
  pub fn parse(text: &str) -> Self {
    match text.trim() {
      "created" => ContainerStatus::Created,
      "running" => ContainerStatus::Running,
      "paused" => ContainerStatus::Paused,
      "restarting" => ContainerStatus::Restarting,
      "exited" => ContainerStatus::Exited,
      "dead" => ContainerStatus::Dead,
      other => ContainerStatus::Other(other.to_string()),
    }
  }
}

/// A started exec call
pub trait ExecHandle: Send {
  /// Exit code once the call returns, `None` if `timeout` elapsed first
  fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>>;

  /// Forcibly end the exec call and everything it started on this side
  fn kill(&mut self) -> Result<()>;

  /// Bytes written to stdout and stderr so far
  fn output(self: Box<Self>) -> Result<(Vec<u8>, Vec<u8>)>;
}

/// Control surface of the container engine
pub trait ContainerEngine: Send + Sync {
  fn create(&self, spec: &ContainerSpec, timeout: Option<Duration>) -> Result<()>;

  fn start(&self, name: &str, timeout: Option<Duration>) -> Result<()>;

  /// Stop with `grace` before the engine escalates to SIGKILL
  fn stop(&self, name: &str, grace: Duration, timeout: Option<Duration>) -> Result<()>;

  /// Remove, killing the container first if needed
  fn remove(&self, name: &str, timeout: Option<Duration>) -> Result<()>;

  /// Copy a host file or directory to `dest` inside the container
  fn copy_in(&self, name: &str, src: &Path, dest: &str, timeout: Option<Duration>) -> Result<()>;

  fn exec(&self, name: &str, request: ExecRequest) -> Result<Box<dyn ExecHandle>>;

  fn inspect(&self, name: &str) -> Result<ContainerStatus>;

  /// Exec and wait for completion, killing the call if `timeout` elapses
  fn exec_to_end(&self, name: &str, request: ExecRequest, timeout: Option<Duration>) -> Result<ExecOutput> {
    let argv = request.argv.join(" ");
    let mut handle = self.exec(name, request)?;
    match handle.wait(timeout)? {
      Some(status) => {
        let (stdout, stderr) = handle.output()?;
        Ok(ExecOutput {
          status,
          stdout,
          stderr,
        })
      }
      None => {
        handle.kill()?;
        Err(SandboxError::engine(format!(
          "exec {} in {} timed out after {:?}",
          argv, name, timeout
        )))
      }
    }
  }

  /// `exec_to_end` that treats a nonzero exit as an engine failure
  fn exec_checked(&self, name: &str, argv: Vec<String>, timeout: Option<Duration>) -> Result<ExecOutput> {
    let command = argv.join(" ");
    let output = self.exec_to_end(name, ExecRequest::new(argv), timeout)?;
    if output.status != 0 {
      return Err(SandboxError::engine(format!(
        "exec {} in {} exited with {}: {}",
        command,
        name,
        output.status,
        String::from_utf8_lossy(&output.stderr)
      )));
    }
    Ok(output)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_parse_docker_states() {
    assert_eq!(ContainerStatus::parse("running\n"), ContainerStatus::Running);
    assert_eq!(ContainerStatus::parse("exited"), ContainerStatus::Exited);
    assert_eq!(
      ContainerStatus::parse("weird"),
      ContainerStatus::Other("weird".to_string())
    );
  }
}
