//! One container plus its lifecycle state, and the commands run inside it.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use log::{error, warn};
use uuid::Uuid;

use crate::config::{ReapMode, SandboxOptions, SANDBOX_USERNAME};
use crate::docker::DockerCli;
use crate::engine::{ContainerEngine, ContainerStatus};
use crate::error::{Result, SandboxError};
use crate::reaper::{ContainerReaper, HostReaper, ReapHook, Reaper};

mod command;
mod files;
mod lifecycle;

#[cfg(test)]
mod fake;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
  Unstarted,
  Running,
  Stopped,
  Destroyed,
}

/// Who owns files added to the working directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOwner {
  /// The unprivileged sandbox account
  Sandbox,
  Root,
}

pub struct Sandbox {
  options: SandboxOptions,
  name: String,
  /// Embedded in the placeholder main process so it can be found when reaping
  unique_id: String,
  engine: Arc<dyn ContainerEngine>,
  reaper: Arc<dyn Reaper>,
  /// Set by `with_reaper`, a custom reaper is never rebuilt
  custom_reaper: bool,
  state: SandboxState,
}

impl Display for SandboxState {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let text = match self {
      SandboxState::Unstarted => "unstarted",
      SandboxState::Running => "running",
      SandboxState::Stopped => "stopped",
      SandboxState::Destroyed => "destroyed",
    };
    write!(f, "{}", text)
  }
}

impl FromStr for FileOwner {
  type Err = SandboxError;

  fn from_str(text: &str) -> Result<Self> {
    match text {
      SANDBOX_USERNAME => Ok(FileOwner::Sandbox),
      "root" => Ok(FileOwner::Root),
      _ => Err(SandboxError::usage(format!(
        "Invalid file owner {}, expected {} or root",
        text, SANDBOX_USERNAME
      ))),
    }
  }
}

impl Sandbox {
  /// An unstarted sandbox backed by the docker command line client
  pub fn new(options: SandboxOptions) -> Self {
    let engine = Arc::new(DockerCli::new(options.docker_bin.clone()));
    Self::with_engine(options, engine)
  }

  pub fn with_engine(options: SandboxOptions, engine: Arc<dyn ContainerEngine>) -> Self {
    let unique_id = format!("sandbox-{}", Uuid::new_v4().simple());
    let name = options.name.clone().unwrap_or_else(|| unique_id.clone());
    let reaper = default_reaper(&options, &engine, &name, None);
    Sandbox {
      options,
      name,
      unique_id,
      engine,
      reaper,
      custom_reaper: false,
      state: SandboxState::Unstarted,
    }
  }

  /// Replace the reaper chosen by `reap_mode`
  pub fn with_reaper(mut self, reaper: Arc<dyn Reaper>) -> Self {
    self.reaper = reaper;
    self.custom_reaper = true;
    self
  }

  /// Called whenever the reaper chosen by `reap_mode` fails to reap a process tree.
  ///
  /// A reaper given to `with_reaper` is kept whatever the call order and the
  /// hook is ignored, attach it to that reaper instead.
  pub fn on_reap_failure(mut self, hook: ReapHook) -> Self {
    if self.custom_reaper {
      warn!("Sandbox {} has a custom reaper, ignoring the reap failure hook", self.name);
      return self;
    }
    self.reaper = default_reaper(&self.options, &self.engine, &self.name, Some(hook));
    self
  }

  /// Start a sandbox, hand it to `f`, and destroy it whatever `f` returns
  pub fn scoped<T, F>(options: SandboxOptions, f: F) -> Result<T>
  where
    F: FnOnce(&mut Sandbox) -> Result<T>,
  {
    Sandbox::new(options).scope(f)
  }

  pub fn scope<T, F>(mut self, f: F) -> Result<T>
  where
    F: FnOnce(&mut Sandbox) -> Result<T>,
  {
    self.start()?;
    let result = f(&mut self);
    let teardown = self.destroy();
    match (result, teardown) {
      (Ok(value), Ok(())) => Ok(value),
      (Err(err), Ok(())) => Err(err),
      (Ok(_), Err(teardown)) => Err(teardown),
      (Err(err), Err(teardown)) => {
        if teardown.is_critical() {
          warn!("Sandbox {} failed before teardown: {}", self.name, err);
          Err(teardown)
        } else {
          warn!("Sandbox {} teardown fails: {}", self.name, teardown);
          Err(err)
        }
      }
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn image(&self) -> &str {
    &self.options.image
  }

  pub fn allow_network_access(&self) -> bool {
    self.options.allow_network_access
  }

  /// Takes effect the next time the container is created
  pub fn set_allow_network_access(&mut self, flag: bool) -> Result<()> {
    if self.state == SandboxState::Running {
      return Err(SandboxError::usage(format!(
        "Cannot change network access of running sandbox {}",
        self.name
      )));
    }
    self.options.allow_network_access = flag;
    Ok(())
  }

  pub fn environment_variables(&self) -> &BTreeMap<String, String> {
    &self.options.env
  }

  pub fn state(&self) -> SandboxState {
    self.state
  }

  /// Status as reported by the container engine
  pub fn container_status(&self) -> Result<ContainerStatus> {
    self.engine.inspect(&self.name)
  }

  /// Absolute path of the placeholder script, also the marker its process carries
  fn main_process_script(&self) -> String {
    format!("/{}-main.sh", self.unique_id)
  }

  fn require_state(&self, expected: &[SandboxState], action: &str) -> Result<()> {
    if expected.contains(&self.state) {
      Ok(())
    } else {
      Err(SandboxError::usage(format!(
        "Cannot {} sandbox {} while it is {}",
        action, self.name, self.state
      )))
    }
  }
}

impl Drop for Sandbox {
  fn drop(&mut self) {
    if self.state == SandboxState::Destroyed {
      return;
    }
    if let Err(err) = self.destroy() {
      if err.is_critical() {
        error!("Sandbox {} may be orphaned: {}", self.name, err);
      } else {
        warn!("Destroy sandbox {} fails: {}", self.name, err);
      }
    }
  }
}

fn default_reaper(
  options: &SandboxOptions,
  engine: &Arc<dyn ContainerEngine>,
  name: &str,
  hook: Option<ReapHook>,
) -> Arc<dyn Reaper> {
  match options.reap_mode {
    ReapMode::Host => {
      let mut reaper = HostReaper::new();
      if let Some(hook) = hook {
        reaper = reaper.on_failure(hook);
      }
      Arc::new(reaper)
    }
    ReapMode::Container => {
      let mut reaper = ContainerReaper::new(engine.clone(), name, options.reap_timeout);
      if let Some(hook) = hook {
        reaper = reaper.on_failure(hook);
      }
      Arc::new(reaper)
    }
  }
}
