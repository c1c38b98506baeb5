use std::fs::File;
use std::io::{self, Seek, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use wait_timeout::ChildExt;

use crate::command::truncated_len;
use crate::config::SANDBOX_USERNAME;
use crate::error::{Result, SandboxError};
use crate::limits::{ResourceLimits, SandboxIdentity};
use crate::protocol::{write_report, write_stream, RunnerReport};
use crate::utils::exit_code;

/// How long to wait for a killed process group to disappear
const GROUP_EXIT_GRACE: Duration = Duration::from_secs(5);

const EXIT_NOT_FOUND: i32 = 127;
const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Command line of `gradebox-runner`, shared with the controller that builds it
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "gradebox-runner", version, about = "Run one command inside a gradebox sandbox")]
pub struct RunnerArgs {
  /// Correlation token used to find this invocation when reaping
  #[arg(long)]
  pub cmd_id: String,

  /// Time limit in seconds
  #[arg(long)]
  pub timeout: Option<u64>,

  /// Set the process count limit to zero
  #[arg(long)]
  pub block_process_spawn: bool,

  #[arg(long)]
  pub max_stack_size: Option<u64>,

  #[arg(long)]
  pub max_virtual_memory: Option<u64>,

  #[arg(long)]
  pub truncate_stdout: Option<u64>,

  #[arg(long)]
  pub truncate_stderr: Option<u64>,

  /// Keep root privileges for the command
  #[arg(long)]
  pub as_root: bool,

  /// Give the command an empty stdin instead of the runner's own
  #[arg(long)]
  pub stdin_devnull: bool,

  /// Unprivileged account to run as
  #[arg(long, default_value = SANDBOX_USERNAME)]
  pub user: String,

  #[arg(last = true, required = true, help = "Command and arguments")]
  pub args: Vec<String>,
}

impl RunnerArgs {
  pub fn new<IS: Into<String>>(cmd_id: IS, args: Vec<String>) -> Self {
    RunnerArgs {
      cmd_id: cmd_id.into(),
      timeout: None,
      block_process_spawn: false,
      max_stack_size: None,
      max_virtual_memory: None,
      truncate_stdout: None,
      truncate_stderr: None,
      as_root: false,
      stdin_devnull: false,
      user: SANDBOX_USERNAME.to_string(),
      args,
    }
  }

  /// Flags in the form `gradebox-runner` parses them, without the program name
  pub fn to_argv(&self) -> Vec<String> {
    let mut argv = vec!["--cmd-id".to_string(), self.cmd_id.clone()];
    if let Some(timeout) = self.timeout {
      argv.push("--timeout".to_string());
      argv.push(timeout.to_string());
    }
    if self.block_process_spawn {
      argv.push("--block-process-spawn".to_string());
    }
    if let Some(stack) = self.max_stack_size {
      argv.push("--max-stack-size".to_string());
      argv.push(stack.to_string());
    }
    if let Some(memory) = self.max_virtual_memory {
      argv.push("--max-virtual-memory".to_string());
      argv.push(memory.to_string());
    }
    if let Some(cap) = self.truncate_stdout {
      argv.push("--truncate-stdout".to_string());
      argv.push(cap.to_string());
    }
    if let Some(cap) = self.truncate_stderr {
      argv.push("--truncate-stderr".to_string());
      argv.push(cap.to_string());
    }
    if self.as_root {
      argv.push("--as-root".to_string());
    }
    if self.stdin_devnull {
      argv.push("--stdin-devnull".to_string());
    }
    if self.user != SANDBOX_USERNAME {
      argv.push("--user".to_string());
      argv.push(self.user.clone());
    }
    argv.push("--".to_string());
    argv.extend(self.args.iter().cloned());
    argv
  }
}

/// Captured result of one runner invocation, streams still on disk
pub struct RunnerOutput {
  report: RunnerReport,
  stdout: File,
  stderr: File,
  stdout_len: u64,
  stderr_len: u64,
}

impl RunnerOutput {
  pub fn report(&self) -> &RunnerReport {
    &self.report
  }

  /// Write the framed result
  pub fn emit<W: Write>(mut self, w: &mut W) -> Result<()> {
    write_report(w, &self.report)?;
    self.stdout.rewind()?;
    write_stream(w, &mut self.stdout, self.stdout_len)?;
    self.stderr.rewind()?;
    write_stream(w, &mut self.stderr, self.stderr_len)?;
    w.flush()?;
    Ok(())
  }
}

/// Run the command described by `args` with stdin chosen by `--stdin-devnull`
pub fn execute(args: &RunnerArgs) -> Result<RunnerOutput> {
  let stdin = if args.stdin_devnull {
    Stdio::null()
  } else {
    Stdio::inherit()
  };
  execute_with_stdin(args, stdin)
}

pub fn execute_with_stdin(args: &RunnerArgs, stdin: Stdio) -> Result<RunnerOutput> {
  let program = args
    .args
    .first()
    .ok_or_else(|| SandboxError::runner("No command given"))?;

  let identity = if args.as_root {
    None
  } else {
    Some(SandboxIdentity::lookup(&args.user)?)
  };
  let limits = ResourceLimits::new()
    .run_as(identity.as_ref())
    .block_process_spawn(args.block_process_spawn)
    .max_stack_size(args.max_stack_size)
    .max_virtual_memory(args.max_virtual_memory);
  limits.log();

  let stdout = tempfile::tempfile()?;
  let mut stderr = tempfile::tempfile()?;

  let mut command = Command::new(program);
  command
    .args(&args.args[1..])
    .stdin(stdin)
    .stdout(Stdio::from(stdout.try_clone()?))
    .stderr(Stdio::from(stderr.try_clone()?))
    .process_group(0);
  if let Some(identity) = &identity {
    command.envs(identity.env_overrides());
  }
  unsafe {
    command.pre_exec(move || limits.apply().map_err(io::Error::from));
  }

  info!("Start running {} (cmd id = {})", args.args.join(" "), args.cmd_id);

  let (return_code, timed_out) = match command.spawn() {
    Ok(child) => wait_child(child, args.timeout)?,
    Err(err) => {
      let code = spawn_failure_code(&err).ok_or_else(|| {
        SandboxError::runner(format!("Spawn {} fails: {}", program, err))
      })?;
      warn!("Cannot run {}: {}", program, err);
      writeln!(stderr, "gradebox-runner: {}: {}", program, err)?;
      (Some(code), false)
    }
  };
  drop(command);

  let (stdout_len, stdout_truncated) = truncated_len(stdout.metadata()?.len(), args.truncate_stdout);
  let (stderr_len, stderr_truncated) = truncated_len(stderr.metadata()?.len(), args.truncate_stderr);

  Ok(RunnerOutput {
    report: RunnerReport {
      cmd_args: args.args.clone(),
      return_code,
      timed_out,
      stdout_truncated,
      stderr_truncated,
    },
    stdout,
    stderr,
    stdout_len,
    stderr_len,
  })
}

/// Wait for the child, killing its whole process group on timeout
fn wait_child(mut child: Child, timeout: Option<u64>) -> Result<(Option<i32>, bool)> {
  let pgid = Pid::from_raw(child.id() as i32);

  let status = match timeout {
    Some(seconds) => child.wait_timeout(Duration::from_secs(seconds))?,
    None => Some(child.wait()?),
  };

  match status {
    Some(status) => {
      let code = exit_code(status);
      info!("Child process #{}. exited with status {}", pgid, code);
      Ok((Some(code), false))
    }
    None => {
      info!("Child process #{}. timed out, killing process group", pgid);
      kill_group(pgid)?;
      child.wait()?;
      wait_group_exit(pgid, GROUP_EXIT_GRACE);
      Ok((None, true))
    }
  }
}

fn kill_group(pgid: Pid) -> Result<()> {
  match killpg(pgid, Signal::SIGKILL) {
    Ok(()) | Err(Errno::ESRCH) => Ok(()),
    Err(err) => Err(err.into()),
  }
}

/// Poll until no process is left in the group or `grace` elapses
fn wait_group_exit(pgid: Pid, grace: Duration) -> bool {
  let deadline = Instant::now() + grace;
  loop {
    if let Err(Errno::ESRCH) = killpg(pgid, None) {
      return true;
    }
    if Instant::now() >= deadline {
      warn!("Process group {} still has members after {:?}", pgid, grace);
      return false;
    }
    sleep(Duration::from_millis(10));
  }
}

fn spawn_failure_code(err: &io::Error) -> Option<i32> {
  match err.raw_os_error().map(Errno::from_i32) {
    Some(Errno::ENOENT) => Some(EXIT_NOT_FOUND),
    Some(Errno::EACCES) | Some(Errno::ENOTDIR) | Some(Errno::ENOEXEC) => Some(EXIT_NOT_EXECUTABLE),
    _ => {
      debug!("Spawn error {:?} is not a command error", err);
      None
    }
  }
}
