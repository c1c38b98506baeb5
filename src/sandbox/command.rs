use std::fs::File;
use std::io::{Cursor, Seek, Write};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::command::{CommandSpec, CommandStdin, CompletedCommand};
use crate::config::{RUNNER_PATH, SANDBOX_WORKING_DIR};
use crate::engine::ExecRequest;
use crate::error::{Result, SandboxError};
use crate::protocol::read_frame;
use crate::runner::RunnerArgs;
use crate::sandbox::{Sandbox, SandboxState};

const FALLBACK_TIMEOUT_MESSAGE: &[u8] = b"The command exceeded the fallback timeout. \
This can happen when subprocesses several levels down use a lot of memory \
and are not stopped properly by their parent process. \
If this occurs frequently, contact your system administrator.\n";

impl Sandbox {
  /// Run one command through `gradebox-runner`.
  ///
  /// A nonzero exit or a timeout is reported in the result, not as an error,
  /// unless the command was built with `check`.
  pub fn run_command(&mut self, spec: CommandSpec) -> Result<CompletedCommand> {
    self.require_state(&[SandboxState::Running], "run a command in")?;

    let cmd_id = format!("{}_cmd{}", self.unique_id, Uuid::new_v4().simple());
    let stdin = stdin_file(spec.stdin)?;
    let runner_args = RunnerArgs {
      cmd_id: cmd_id.clone(),
      timeout: spec.timeout,
      block_process_spawn: spec.block_process_spawn,
      max_stack_size: spec.max_stack_size,
      max_virtual_memory: spec.max_virtual_memory,
      truncate_stdout: spec.truncate_stdout,
      truncate_stderr: spec.truncate_stderr,
      as_root: spec.as_root,
      stdin_devnull: stdin.is_none(),
      ..RunnerArgs::new(cmd_id.clone(), spec.args)
    };
    let mut argv = vec![RUNNER_PATH.to_string()];
    argv.extend(runner_args.to_argv());
    debug!("Running {} in sandbox {}", argv.join(" "), self.name);

    let fallback_timeout = self.options.fallback_timeout(spec.timeout);
    let request = ExecRequest::new(argv)
      .stdin(stdin)
      .working_dir(SANDBOX_WORKING_DIR);
    let mut handle = self.engine.exec(&self.name, request)?;

    let mut completed = match handle.wait(fallback_timeout)? {
      Some(status) => {
        let (stdout, stderr) = handle.output()?;
        if status != 0 {
          return Err(SandboxError::engine(format!(
            "gradebox-runner in {} exited with {}: {}",
            self.name,
            status,
            String::from_utf8_lossy(&stderr).trim_end()
          )));
        }
        let frame = read_frame(&mut Cursor::new(stdout))?;
        CompletedCommand {
          return_code: frame.report.return_code,
          timed_out: frame.report.timed_out,
          stdout: frame.stdout,
          stderr: frame.stderr,
          stdout_truncated: frame.report.stdout_truncated,
          stderr_truncated: frame.report.stderr_truncated,
        }
      }
      None => {
        info!(
          "Command {} in sandbox {} exceeded the fallback timeout {:?}, reaping",
          cmd_id, self.name, fallback_timeout
        );
        self.reaper.reap(&cmd_id);
        handle.kill()?;
        let (stdout, stderr) = handle.output()?;
        fallback_result(stdout, stderr)
      }
    };

    completed.apply_truncation(spec.truncate_stdout, spec.truncate_stderr);

    if spec.check && !completed.success() {
      return Err(SandboxError::command(completed));
    }
    Ok(completed)
  }
}

/// Open a file for the exec call's stdin, `None` means an empty stdin
fn stdin_file(stdin: CommandStdin) -> Result<Option<File>> {
  match stdin {
    CommandStdin::Closed => Ok(None),
    CommandStdin::File(file) => Ok(Some(file)),
    CommandStdin::Bytes(bytes) => {
      let mut file = tempfile::tempfile()?;
      file.write_all(&bytes)?;
      file.rewind()?;
      Ok(Some(file))
    }
  }
}

/// Result for an exec call that never returned. The runner may still have
/// emitted a full frame before the call hung, otherwise its raw output is kept.
fn fallback_result(stdout: Vec<u8>, stderr: Vec<u8>) -> CompletedCommand {
  let (stdout, runner_stderr, stdout_truncated, stderr_truncated) =
    match read_frame(&mut Cursor::new(&stdout)) {
      Ok(frame) => (
        frame.stdout,
        frame.stderr,
        frame.report.stdout_truncated,
        frame.report.stderr_truncated,
      ),
      Err(err) => {
        warn!("No complete runner frame after fallback timeout: {}", err);
        (stdout, stderr, false, false)
      }
    };
  let mut message = FALLBACK_TIMEOUT_MESSAGE.to_vec();
  message.extend(runner_stderr);
  CompletedCommand {
    return_code: None,
    timed_out: true,
    stdout,
    stderr: message,
    stdout_truncated,
    stderr_truncated,
  }
}
