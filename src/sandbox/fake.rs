//! In-memory container engine and reaper for controller tests.

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SandboxOptions;
use crate::engine::{ContainerEngine, ContainerSpec, ContainerStatus, ExecHandle, ExecRequest};
use crate::error::{Result, SandboxError};
use crate::protocol::{write_report, write_stream, RunnerReport};
use crate::reaper::Reaper;
use crate::sandbox::Sandbox;

/// Scripted outcome of one exec call, `status: None` never returns
#[derive(Debug, Clone)]
pub(crate) struct FakeExec {
  pub status: Option<i32>,
  pub stdout: Vec<u8>,
  pub stderr: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct FakeEngine {
  calls: Arc<Mutex<Vec<String>>>,
  failures: Mutex<HashMap<&'static str, usize>>,
  timeouts: Mutex<HashMap<&'static str, usize>>,
  execs: Mutex<VecDeque<FakeExec>>,
  exec_argvs: Mutex<Vec<Vec<String>>>,
  stdins: Mutex<Vec<Vec<u8>>>,
  working_dirs: Mutex<Vec<Option<String>>>,
  specs: Mutex<Vec<ContainerSpec>>,
}

struct FakeHandle {
  exec: FakeExec,
  calls: Arc<Mutex<Vec<String>>>,
}

#[derive(Default)]
pub(crate) struct RecordingReaper {
  tokens: Mutex<Vec<String>>,
}

impl FakeExec {
  /// A runner that finished and emitted a well-formed frame
  pub fn finished(report: RunnerReport, stdout: &[u8], stderr: &[u8]) -> Self {
    let mut frame = vec![];
    write_report(&mut frame, &report).unwrap();
    write_stream(&mut frame, &mut Cursor::new(stdout), stdout.len() as u64).unwrap();
    write_stream(&mut frame, &mut Cursor::new(stderr), stderr.len() as u64).unwrap();
    FakeExec {
      status: Some(0),
      stdout: frame,
      stderr: vec![],
    }
  }

  pub fn hang(stdout: &[u8], stderr: &[u8]) -> Self {
    FakeExec {
      status: None,
      stdout: stdout.to_vec(),
      stderr: stderr.to_vec(),
    }
  }

  pub fn failed(status: i32, stderr: &[u8]) -> Self {
    FakeExec {
      status: Some(status),
      stdout: vec![],
      stderr: stderr.to_vec(),
    }
  }
}

impl FakeEngine {
  /// Make the next `times` calls of `op` fail
  pub fn fail(&self, op: &'static str, times: usize) {
    self.failures.lock().unwrap().insert(op, times);
  }

  /// Make the next `times` calls of `op` time out
  pub fn time_out(&self, op: &'static str, times: usize) {
    self.timeouts.lock().unwrap().insert(op, times);
  }

  pub fn push_exec(&self, exec: FakeExec) {
    self.execs.lock().unwrap().push_back(exec);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn exec_argvs(&self) -> Vec<Vec<String>> {
    self.exec_argvs.lock().unwrap().clone()
  }

  pub fn stdins(&self) -> Vec<Vec<u8>> {
    self.stdins.lock().unwrap().clone()
  }

  pub fn working_dirs(&self) -> Vec<Option<String>> {
    self.working_dirs.lock().unwrap().clone()
  }

  pub fn specs(&self) -> Vec<ContainerSpec> {
    self.specs.lock().unwrap().clone()
  }

  fn record(&self, op: &'static str, call: String) -> Result<()> {
    self.calls.lock().unwrap().push(call);
    if let Some(remaining) = self.timeouts.lock().unwrap().get_mut(op) {
      if *remaining > 0 {
        *remaining -= 1;
        return Err(SandboxError::engine_timeout(format!("fake {} timeout", op)));
      }
    }
    let mut failures = self.failures.lock().unwrap();
    match failures.get_mut(op) {
      Some(remaining) if *remaining > 0 => {
        *remaining -= 1;
        Err(SandboxError::engine(format!("fake {} failure", op)))
      }
      _ => Ok(()),
    }
  }
}

impl ContainerEngine for FakeEngine {
  fn create(&self, spec: &ContainerSpec, _timeout: Option<Duration>) -> Result<()> {
    self.specs.lock().unwrap().push(spec.clone());
    self.record("create", format!("create {}", spec.name))
  }

  fn start(&self, name: &str, _timeout: Option<Duration>) -> Result<()> {
    self.record("start", format!("start {}", name))
  }

  fn stop(&self, name: &str, grace: Duration, _timeout: Option<Duration>) -> Result<()> {
    self.record("stop", format!("stop {} {}", name, grace.as_secs()))
  }

  fn remove(&self, name: &str, _timeout: Option<Duration>) -> Result<()> {
    self.record("remove", format!("remove {}", name))
  }

  fn copy_in(&self, name: &str, _src: &Path, dest: &str, _timeout: Option<Duration>) -> Result<()> {
    self.record("copy_in", format!("copy_in {} {}", name, dest))
  }

  fn exec(&self, name: &str, request: ExecRequest) -> Result<Box<dyn ExecHandle>> {
    self.record("exec", format!("exec {} {}", name, request.argv.join(" ")))?;
    let mut stdin = vec![];
    if let Some(mut file) = request.stdin {
      file.read_to_end(&mut stdin)?;
    }
    self.stdins.lock().unwrap().push(stdin);
    self.exec_argvs.lock().unwrap().push(request.argv.clone());
    self.working_dirs.lock().unwrap().push(request.working_dir.clone());

    let exec = self.execs.lock().unwrap().pop_front().unwrap_or_else(|| {
      let cmd_args = match request.argv.iter().position(|arg| arg == "--") {
        Some(index) => request.argv[index + 1..].to_vec(),
        None => request.argv.clone(),
      };
      FakeExec::finished(
        RunnerReport {
          cmd_args,
          return_code: Some(0),
          timed_out: false,
          stdout_truncated: false,
          stderr_truncated: false,
        },
        b"",
        b"",
      )
    });
    Ok(Box::new(FakeHandle {
      exec,
      calls: self.calls.clone(),
    }))
  }

  fn inspect(&self, name: &str) -> Result<ContainerStatus> {
    self.record("inspect", format!("inspect {}", name))?;
    Ok(ContainerStatus::Running)
  }
}

impl ExecHandle for FakeHandle {
  fn wait(&mut self, _timeout: Option<Duration>) -> Result<Option<i32>> {
    Ok(self.exec.status)
  }

  fn kill(&mut self) -> Result<()> {
    self.calls.lock().unwrap().push("kill exec".to_string());
    Ok(())
  }

  fn output(self: Box<Self>) -> Result<(Vec<u8>, Vec<u8>)> {
    Ok((self.exec.stdout, self.exec.stderr))
  }
}

impl RecordingReaper {
  pub fn tokens(&self) -> Vec<String> {
    self.tokens.lock().unwrap().clone()
  }
}

impl Reaper for RecordingReaper {
  fn reap(&self, token: &str) {
    self.tokens.lock().unwrap().push(token.to_string());
  }
}

/// An unstarted sandbox named `sandbox-unit` on `engine`
pub(crate) fn sandbox(engine: &Arc<FakeEngine>) -> (Sandbox, Arc<RecordingReaper>) {
  let reaper = Arc::new(RecordingReaper::default());
  let mut options = SandboxOptions::default();
  options.name("sandbox-unit").runner_bin("/tmp/gradebox-runner");
  let sandbox = Sandbox::with_engine(options, engine.clone()).with_reaper(reaper.clone());
  (sandbox, reaper)
}
