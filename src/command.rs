use std::fs::File;

/// Where a command's stdin comes from
#[derive(Debug, Default)]
pub enum CommandStdin {
  /// Equivalent to /dev/null
  #[default]
  Closed,
  File(File),
  Bytes(Vec<u8>),
}

/// One command to be run inside a sandbox
#[derive(Debug)]
pub struct CommandSpec {
  pub(crate) args: Vec<String>,
  pub(crate) as_root: bool,
  pub(crate) stdin: CommandStdin,
  pub(crate) timeout: Option<u64>,
  pub(crate) block_process_spawn: bool,
  pub(crate) max_stack_size: Option<u64>,
  pub(crate) max_virtual_memory: Option<u64>,
  pub(crate) truncate_stdout: Option<u64>,
  pub(crate) truncate_stderr: Option<u64>,
  pub(crate) check: bool,
}

/// Result of a command run inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCommand {
  /// `None` when the command timed out before an exit status was known
  pub return_code: Option<i32>,
  pub timed_out: bool,
  pub stdout: Vec<u8>,
  pub stderr: Vec<u8>,
  pub stdout_truncated: bool,
  pub stderr_truncated: bool,
}

impl CommandSpec {
  pub fn new<AS: Into<String>>(args: Vec<AS>) -> Self {
    CommandSpec {
      args: args.into_iter().map(|a| a.into()).collect(),
      as_root: false,
      stdin: CommandStdin::Closed,
      timeout: None,
      block_process_spawn: false,
      max_stack_size: None,
      max_virtual_memory: None,
      truncate_stdout: None,
      truncate_stderr: None,
      check: false,
    }
  }

  pub fn as_root(mut self, flag: bool) -> Self {
    self.as_root = flag;
    self
  }

  pub fn stdin(mut self, stdin: CommandStdin) -> Self {
    self.stdin = stdin;
    self
  }

  pub fn stdin_bytes<B: Into<Vec<u8>>>(self, bytes: B) -> Self {
    self.stdin(CommandStdin::Bytes(bytes.into()))
  }

  /// Time limit in seconds, enforced inside the container
  pub fn timeout(mut self, seconds: Option<u64>) -> Self {
    self.timeout = seconds;
    self
  }

  pub fn block_process_spawn(mut self, flag: bool) -> Self {
    self.block_process_spawn = flag;
    self
  }

  pub fn max_stack_size(mut self, bytes: Option<u64>) -> Self {
    self.max_stack_size = bytes;
    self
  }

  pub fn max_virtual_memory(mut self, bytes: Option<u64>) -> Self {
    self.max_virtual_memory = bytes;
    self
  }

  pub fn truncate_stdout(mut self, bytes: Option<u64>) -> Self {
    self.truncate_stdout = bytes;
    self
  }

  pub fn truncate_stderr(mut self, bytes: Option<u64>) -> Self {
    self.truncate_stderr = bytes;
    self
  }

  /// Turn a nonzero exit or a timeout into `SandboxError::Command`
  pub fn check(mut self, flag: bool) -> Self {
    self.check = flag;
    self
  }

  pub fn args(&self) -> &[String] {
    &self.args
  }
}

impl CompletedCommand {
  pub fn success(&self) -> bool {
    !self.timed_out && self.return_code == Some(0)
  }

  pub fn stdout_lossy(&self) -> String {
    String::from_utf8_lossy(&self.stdout).into_owned()
  }

  pub fn stderr_lossy(&self) -> String {
    String::from_utf8_lossy(&self.stderr).into_owned()
  }

  /// Apply caps on top of whatever the runner already applied.
  /// A flag that is already set stays set.
  pub(crate) fn apply_truncation(&mut self, stdout_cap: Option<u64>, stderr_cap: Option<u64>) {
    self.stdout_truncated |= truncate_in_place(&mut self.stdout, stdout_cap);
    self.stderr_truncated |= truncate_in_place(&mut self.stderr, stderr_cap);
  }
}

/// Bytes kept for a stream of `len` bytes under `cap`, and whether anything was dropped
pub fn truncated_len(len: u64, cap: Option<u64>) -> (u64, bool) {
  match cap {
    Some(cap) if len > cap => (cap, true),
    _ => (len, false),
  }
}

fn truncate_in_place(buf: &mut Vec<u8>, cap: Option<u64>) -> bool {
  let (keep, truncated) = truncated_len(buf.len() as u64, cap);
  if truncated {
    buf.truncate(keep as usize);
  }
  truncated
}
