use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SandboxError};

pub const SANDBOX_USERNAME: &str = "autograder";
pub const SANDBOX_HOME_DIR: &str = "/home/autograder";
pub const SANDBOX_WORKING_DIR: &str = "/home/autograder/working_dir";
pub const RUNNER_PATH: &str = "/usr/local/bin/gradebox-runner";
pub const REAPER_PATH: &str = "/usr/local/bin/gradebox-reap";

pub const DEFAULT_DOCKER_IMAGE: &str = "eecsautograder/ubuntu22:latest";
pub const DEFAULT_PIDS_LIMIT: u64 = 512;
pub const DEFAULT_MEMORY_LIMIT: &str = "4g";
pub const DEFAULT_MIN_FALLBACK_TIMEOUT: u64 = 60;

/// How orphaned processes are located
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapMode {
  /// Scan the controller host's /proc, which sees every container process
  Host,
  /// Run `gradebox-reap` inside the container's PID namespace
  Container,
}

impl FromStr for ReapMode {
  type Err = SandboxError;

  fn from_str(text: &str) -> Result<Self> {
    match text {
      "host" => Ok(ReapMode::Host),
      "container" => Ok(ReapMode::Container),
      _ => Err(SandboxError::usage(format!("Unknown reap mode: {}", text))),
    }
  }
}

/// Launch-time configuration of one sandbox
#[derive(Debug, Clone)]
pub struct SandboxOptions {
  pub(crate) name: Option<String>,
  pub(crate) image: String,
  pub(crate) allow_network_access: bool,
  pub(crate) env: BTreeMap<String, String>,
  pub(crate) pids_limit: u64,
  pub(crate) memory_limit: String,
  pub(crate) cpu_core_limit: Option<f64>,
  pub(crate) min_fallback_timeout: u64,
  pub(crate) create_timeout: Option<Duration>,
  pub(crate) setup_timeout: Duration,
  pub(crate) teardown_timeout: Duration,
  pub(crate) stop_grace_period: Duration,
  pub(crate) stop_retry_grace_period: Duration,
  pub(crate) reap_timeout: Duration,
  pub(crate) reap_mode: ReapMode,
  pub(crate) docker_bin: String,
  pub(crate) runner_bin: PathBuf,
  pub(crate) reaper_bin: PathBuf,
}

impl Default for SandboxOptions {
  fn default() -> Self {
    SandboxOptions {
      name: None,
      image: DEFAULT_DOCKER_IMAGE.to_string(),
      allow_network_access: false,
      env: BTreeMap::new(),
      pids_limit: DEFAULT_PIDS_LIMIT,
      memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
      cpu_core_limit: None,
      min_fallback_timeout: DEFAULT_MIN_FALLBACK_TIMEOUT,
      create_timeout: None,
      setup_timeout: Duration::from_secs(30),
      teardown_timeout: Duration::from_secs(10),
      stop_grace_period: Duration::from_secs(3),
      stop_retry_grace_period: Duration::from_secs(1),
      reap_timeout: Duration::from_secs(10),
      reap_mode: ReapMode::Host,
      docker_bin: "docker".to_string(),
      runner_bin: sibling_binary("gradebox-runner"),
      reaper_bin: sibling_binary("gradebox-reap"),
    }
  }
}

impl SandboxOptions {
  /// Defaults overridden by `SANDBOX_*` / `GRADEBOX_*` environment variables
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub(crate) fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
    let mut options = SandboxOptions::default();

    if let Some(image) = lookup("SANDBOX_DOCKER_IMAGE") {
      options.image = image;
    }
    if let Some(value) = lookup("SANDBOX_PIDS_LIMIT") {
      options.pids_limit = parse_number("SANDBOX_PIDS_LIMIT", &value)?;
    }
    if let Some(value) = lookup("SANDBOX_MEM_LIMIT") {
      options.memory_limit = value;
    }
    if let Some(value) = lookup("SANDBOX_CPU_CORE_LIMIT") {
      options.cpu_core_limit = Some(parse_number("SANDBOX_CPU_CORE_LIMIT", &value)?);
    }
    if let Some(value) = lookup("SANDBOX_MIN_FALLBACK_TIMEOUT") {
      options.min_fallback_timeout = parse_number("SANDBOX_MIN_FALLBACK_TIMEOUT", &value)?;
    }
    if let Some(value) = lookup("SANDBOX_CREATE_TIMEOUT") {
      options.create_timeout = Some(parse_seconds("SANDBOX_CREATE_TIMEOUT", &value)?);
    }
    if let Some(value) = lookup("SANDBOX_SETUP_TIMEOUT") {
      options.setup_timeout = parse_seconds("SANDBOX_SETUP_TIMEOUT", &value)?;
    }
    if let Some(value) = lookup("SANDBOX_TEARDOWN_TIMEOUT") {
      options.teardown_timeout = parse_seconds("SANDBOX_TEARDOWN_TIMEOUT", &value)?;
    }
    if let Some(value) = lookup("SANDBOX_REAP_TIMEOUT") {
      options.reap_timeout = parse_seconds("SANDBOX_REAP_TIMEOUT", &value)?;
    }
    if let Some(value) = lookup("SANDBOX_REAP_MODE") {
      options.reap_mode = value.parse()?;
    }
    if let Some(value) = lookup("SANDBOX_DOCKER_BIN") {
      options.docker_bin = value;
    }
    if let Some(value) = lookup("GRADEBOX_RUNNER_BIN") {
      options.runner_bin = PathBuf::from(value);
    }
    if let Some(value) = lookup("GRADEBOX_REAP_BIN") {
      options.reaper_bin = PathBuf::from(value);
    }

    Ok(options)
  }

  /// Must be unique among live containers, a random name is used otherwise
  pub fn name<NS: Into<String>>(&mut self, name: NS) -> &mut Self {
    self.name = Some(name.into());
    self
  }

  pub fn image<IS: Into<String>>(&mut self, image: IS) -> &mut Self {
    self.image = image.into();
    self
  }

  pub fn allow_network_access(&mut self, flag: bool) -> &mut Self {
    self.allow_network_access = flag;
    self
  }

  pub fn env<KS: Into<String>, VS: Into<String>>(&mut self, key: KS, value: VS) -> &mut Self {
    self.env.insert(key.into(), value.into());
    self
  }

  pub fn pids_limit(&mut self, value: u64) -> &mut Self {
    self.pids_limit = value;
    self
  }

  /// Docker memory size, e.g. `256m` or `4g`
  pub fn memory_limit<MS: Into<String>>(&mut self, value: MS) -> &mut Self {
    self.memory_limit = value.into();
    self
  }

  pub fn cpu_core_limit(&mut self, value: Option<f64>) -> &mut Self {
    self.cpu_core_limit = value;
    self
  }

  pub fn min_fallback_timeout(&mut self, seconds: u64) -> &mut Self {
    self.min_fallback_timeout = seconds;
    self
  }

  pub fn create_timeout(&mut self, value: Option<Duration>) -> &mut Self {
    self.create_timeout = value;
    self
  }

  pub fn setup_timeout(&mut self, value: Duration) -> &mut Self {
    self.setup_timeout = value;
    self
  }

  pub fn teardown_timeout(&mut self, value: Duration) -> &mut Self {
    self.teardown_timeout = value;
    self
  }

  pub fn stop_grace_periods(&mut self, first: Duration, retry: Duration) -> &mut Self {
    self.stop_grace_period = first;
    self.stop_retry_grace_period = retry;
    self
  }

  pub fn reap_mode(&mut self, mode: ReapMode) -> &mut Self {
    self.reap_mode = mode;
    self
  }

  pub fn reap_timeout(&mut self, value: Duration) -> &mut Self {
    self.reap_timeout = value;
    self
  }

  pub fn docker_bin<BS: Into<String>>(&mut self, bin: BS) -> &mut Self {
    self.docker_bin = bin.into();
    self
  }

  pub fn runner_bin<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
    self.runner_bin = path.into();
    self
  }

  pub fn reaper_bin<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
    self.reaper_bin = path.into();
    self
  }

  /// Bound on the outer exec call for a command with the given inner timeout
  pub fn fallback_timeout(&self, timeout: Option<u64>) -> Option<Duration> {
    timeout.map(|seconds| {
      Duration::from_secs(seconds.saturating_mul(2).max(self.min_fallback_timeout))
    })
  }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
  value
    .trim()
    .parse::<T>()
    .map_err(|_| SandboxError::usage(format!("Invalid value for {}: {}", key, value)))
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration> {
  parse_number::<u64>(key, value).map(Duration::from_secs)
}

/// Helper binaries are installed next to the controller by default
fn sibling_binary(name: &str) -> PathBuf {
  env::current_exe()
    .ok()
    .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
    .unwrap_or_else(|| PathBuf::from(name))
}
