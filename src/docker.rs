use std::fs::File;
use std::io::{Read, Seek};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use wait_timeout::ChildExt;

use crate::engine::{ContainerEngine, ContainerSpec, ContainerStatus, ExecHandle, ExecOutput, ExecRequest};
use crate::error::{Result, SandboxError};
use crate::utils::exit_code;

const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Container engine driven through the docker command line client
#[derive(Debug, Clone)]
pub struct DockerCli {
  bin: String,
}

/// A running `docker exec`, outputs spooled to temporary files
pub struct DockerExec {
  child: Child,
  stdout: File,
  stderr: File,
  description: String,
}

impl DockerCli {
  pub fn new<BS: Into<String>>(bin: BS) -> Self {
    DockerCli { bin: bin.into() }
  }

  /// Start the client in its own process group so a timeout can kill
  /// everything it spawned
  fn spawn(&self, args: &[String], stdin: Stdio) -> Result<(Child, File, File)> {
    debug!("Running {} {}", self.bin, args.join(" "));
    let stdout = tempfile::tempfile()?;
    let stderr = tempfile::tempfile()?;
    let child = Command::new(&self.bin)
      .args(args)
      .stdin(stdin)
      .stdout(Stdio::from(stdout.try_clone()?))
      .stderr(Stdio::from(stderr.try_clone()?))
      .process_group(0)
      .spawn()
      .map_err(|err| SandboxError::engine(format!("Spawn {} fails: {}", self.bin, err)))?;
    Ok((child, stdout, stderr))
  }

  /// Run one client command to completion, whatever its exit status
  fn run_unchecked(&self, args: Vec<String>, timeout: Option<Duration>) -> Result<ExecOutput> {
    let (child, stdout, stderr) = self.spawn(&args, Stdio::null())?;
    let mut handle = DockerExec {
      child,
      stdout,
      stderr,
      description: format!("{} {}", self.bin, args.join(" ")),
    };
    match handle.wait(timeout)? {
      Some(status) => {
        let (stdout, stderr) = Box::new(handle).output()?;
        Ok(ExecOutput { status, stdout, stderr })
      }
      None => {
        handle.kill()?;
        Err(SandboxError::engine_timeout(format!(
          "{} timed out after {:?}",
          handle.description, timeout
        )))
      }
    }
  }

  /// Run one client command, any nonzero exit is an engine failure
  fn run(&self, args: Vec<String>, timeout: Option<Duration>) -> Result<ExecOutput> {
    let command = args.join(" ");
    let output = self.run_unchecked(args, timeout)?;
    if output.status != 0 {
      return Err(SandboxError::engine(format!(
        "{} {} exited with {}: {}",
        self.bin,
        command,
        output.status,
        String::from_utf8_lossy(&output.stderr).trim_end()
      )));
    }
    Ok(output)
  }
}

impl Default for DockerCli {
  fn default() -> Self {
    DockerCli::new("docker")
  }
}

/// Arguments of `docker exec` for `request`
pub fn exec_args(name: &str, request: &ExecRequest) -> Vec<String> {
  let mut args = vec!["exec".to_string(), "-i".to_string()];
  if let Some(dir) = &request.working_dir {
    args.push("-w".to_string());
    args.push(dir.clone());
  }
  args.push(name.to_string());
  args.extend(request.argv.iter().cloned());
  args
}

/// Arguments of `docker create` for `spec`
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
  let mut args = vec![
    "create".to_string(),
    format!("--name={}", spec.name),
    // Keep the placeholder's stdin open
    "-i".to_string(),
    "-t".to_string(),
    "--pids-limit".to_string(),
    spec.pids_limit.to_string(),
    "--memory".to_string(),
    spec.memory_limit.clone(),
    "--memory-swap".to_string(),
    spec.memory_limit.clone(),
    "--oom-kill-disable".to_string(),
  ];
  if let Some(cpus) = spec.cpu_core_limit {
    args.push("--cpus".to_string());
    args.push(cpus.to_string());
  }
  if !spec.allow_network_access {
    args.push("--net".to_string());
    args.push("none".to_string());
  }
  for (key, value) in &spec.env {
    args.push("-e".to_string());
    args.push(format!("{}={}", key, value));
  }
  // Image entrypoints could exit and take the container down with them
  args.push("--entrypoint".to_string());
  args.push(String::new());
  args.push(spec.image.clone());
  args.extend(spec.command.iter().cloned());
  args
}

impl ContainerEngine for DockerCli {
  fn create(&self, spec: &ContainerSpec, timeout: Option<Duration>) -> Result<()> {
    self.run(create_args(spec), timeout)?;
    Ok(())
  }

  fn start(&self, name: &str, timeout: Option<Duration>) -> Result<()> {
    self.run(vec!["start".to_string(), name.to_string()], timeout)?;
    Ok(())
  }

  fn stop(&self, name: &str, grace: Duration, timeout: Option<Duration>) -> Result<()> {
    let args = vec![
      "stop".to_string(),
      "--time".to_string(),
      grace.as_secs().to_string(),
      name.to_string(),
    ];
    self.run(args, timeout)?;
    Ok(())
  }

  fn remove(&self, name: &str, timeout: Option<Duration>) -> Result<()> {
    self.run(vec!["rm".to_string(), "-f".to_string(), name.to_string()], timeout)?;
    Ok(())
  }

  fn copy_in(&self, name: &str, src: &Path, dest: &str, timeout: Option<Duration>) -> Result<()> {
    let args = vec![
      "cp".to_string(),
      src.to_string_lossy().to_string(),
      format!("{}:{}", name, dest),
    ];
    self.run(args, timeout)?;
    Ok(())
  }

  fn exec(&self, name: &str, request: ExecRequest) -> Result<Box<dyn ExecHandle>> {
    let args = exec_args(name, &request);
    let stdin = match request.stdin {
      Some(file) => Stdio::from(file),
      None => Stdio::null(),
    };
    let (child, stdout, stderr) = self.spawn(&args, stdin)?;
    Ok(Box::new(DockerExec {
      child,
      stdout,
      stderr,
      description: format!("{} {}", self.bin, args.join(" ")),
    }))
  }

  fn inspect(&self, name: &str) -> Result<ContainerStatus> {
    let args = vec![
      "inspect".to_string(),
      "--format".to_string(),
      "{{.State.Status}}".to_string(),
      name.to_string(),
    ];
    let output = self.run_unchecked(args, Some(INSPECT_TIMEOUT))?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    if output.status != 0 {
      if stderr.contains("No such") {
        return Ok(ContainerStatus::Missing);
      }
      return Err(SandboxError::engine(format!(
        "{} inspect {} exited with {}: {}",
        self.bin,
        name,
        output.status,
        stderr.trim_end()
      )));
    }
    Ok(ContainerStatus::parse(&String::from_utf8_lossy(&output.stdout)))
  }
}

impl ExecHandle for DockerExec {
  fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>> {
    let status = match timeout {
      Some(timeout) => self.child.wait_timeout(timeout)?,
      None => Some(self.child.wait()?),
    };
    Ok(status.map(exit_code))
  }

  fn kill(&mut self) -> Result<()> {
    let pgid = Pid::from_raw(self.child.id() as i32);
    warn!("Killing {} (process group {})", self.description, pgid);
    match killpg(pgid, Signal::SIGKILL) {
      Ok(()) | Err(Errno::ESRCH) => {}
      Err(err) => return Err(err.into()),
    }
    self.child.wait()?;
    Ok(())
  }

  fn output(mut self: Box<Self>) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut stdout = vec![];
    self.stdout.rewind()?;
    self.stdout.read_to_end(&mut stdout)?;
    let mut stderr = vec![];
    self.stderr.rewind()?;
    self.stderr.read_to_end(&mut stderr)?;
    Ok((stdout, stderr))
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;
  use std::time::Instant;

  use super::*;

  fn spec() -> ContainerSpec {
    ContainerSpec {
      name: "sandbox-test".to_string(),
      image: "ubuntu:22.04".to_string(),
      env: BTreeMap::from([("LANG".to_string(), "C.UTF-8".to_string())]),
      pids_limit: 64,
      memory_limit: "256m".to_string(),
      cpu_core_limit: None,
      allow_network_access: false,
      command: vec!["/bin/bash".to_string(), "/sandbox-test-main.sh".to_string()],
    }
  }

  #[test]
  fn it_should_build_create_args() {
    let args = create_args(&spec());
    assert_eq!(
      args,
      vec![
        "create",
        "--name=sandbox-test",
        "-i",
        "-t",
        "--pids-limit",
        "64",
        "--memory",
        "256m",
        "--memory-swap",
        "256m",
        "--oom-kill-disable",
        "--net",
        "none",
        "-e",
        "LANG=C.UTF-8",
        "--entrypoint",
        "",
        "ubuntu:22.04",
        "/bin/bash",
        "/sandbox-test-main.sh",
      ]
    );
  }

  #[test]
  fn it_should_keep_network_and_limit_cpus() {
    let mut spec = spec();
    spec.allow_network_access = true;
    spec.cpu_core_limit = Some(1.5);
    let args = create_args(&spec);
    assert!(!args.contains(&"none".to_string()));
    let cpus = args.iter().position(|arg| arg == "--cpus").unwrap();
    assert_eq!(args[cpus + 1], "1.5");
  }

  #[test]
  fn it_should_build_exec_args() {
    let request = ExecRequest::new(vec!["chmod".to_string(), "555".to_string()]);
    assert_eq!(exec_args("sandbox-test", &request), vec!["exec", "-i", "sandbox-test", "chmod", "555"]);

    let request = ExecRequest::new(vec!["ls".to_string()]).working_dir("/home/autograder/working_dir");
    assert_eq!(
      exec_args("sandbox-test", &request),
      vec!["exec", "-i", "-w", "/home/autograder/working_dir", "sandbox-test", "ls"]
    );
  }

  #[test]
  fn it_should_report_client_failures_as_engine_errors() {
    let docker = DockerCli::new("false");
    let result = docker.start("anything", Some(Duration::from_secs(5)));
    assert!(matches!(result, Err(SandboxError::Engine(_))));

    let docker = DockerCli::new("/no/such/docker");
    let result = docker.start("anything", None);
    assert!(matches!(result, Err(SandboxError::Engine(_))));
  }

  #[test]
  fn it_should_kill_a_hung_client() {
    // The "client" is a shell script that never returns
    let script = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(script.path(), "sleep 30\n").unwrap();
    let docker = DockerCli::new("sh");
    let now = Instant::now();
    let result = docker.run(
      vec![script.path().to_string_lossy().to_string()],
      Some(Duration::from_millis(300)),
    );
    assert!(matches!(result, Err(SandboxError::EngineTimeout(_))));
    assert!(now.elapsed() < Duration::from_secs(10));
  }
}
