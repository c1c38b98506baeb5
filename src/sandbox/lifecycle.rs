use std::io::Write;

use log::{error, info, warn};

use crate::config::{ReapMode, REAPER_PATH, RUNNER_PATH};
use crate::engine::ContainerSpec;
use crate::error::{Result, SandboxError};
use crate::sandbox::{Sandbox, SandboxState};

/// Blocks on stdin forever so the container stays up
const MAIN_PROCESS_SCRIPT: &[u8] = b"while :\ndo read; done";

impl Sandbox {
  /// Create and start the container, then inject the helper binaries
  pub fn start(&mut self) -> Result<()> {
    self.require_state(&[SandboxState::Unstarted], "start")?;
    info!("Creating sandbox {} from {}", self.name, self.options.image);

    let spec = self.container_spec();
    if let Err(err) = self.engine.create(&spec, self.options.create_timeout) {
      // A plain failure may be a name collision, the container is not ours to remove
      if err.is_timeout() {
        self.remove_half_created();
      }
      return Err(SandboxError::setup(format!("Create container {} fails: {}", self.name, err)));
    }

    if let Err(err) = self.provision() {
      error!("Setting up sandbox {} fails: {}", self.name, err);
      self.remove_half_created();
      return Err(SandboxError::setup(format!("Set up sandbox {} fails: {}", self.name, err)));
    }

    self.state = SandboxState::Running;
    info!("Sandbox {} is running", self.name);
    Ok(())
  }

  /// Stop the container, reaping and retrying once if the first stop fails
  pub fn stop(&mut self) -> Result<()> {
    if self.state == SandboxState::Stopped {
      return Ok(());
    }
    self.require_state(&[SandboxState::Running], "stop")?;
    self.stop_container()?;
    self.state = SandboxState::Stopped;
    info!("Sandbox {} stopped", self.name);
    Ok(())
  }

  /// Stop if needed and remove the container. Destroying twice is a no-op.
  pub fn destroy(&mut self) -> Result<()> {
    match self.state {
      SandboxState::Destroyed => return Ok(()),
      SandboxState::Unstarted => {
        self.state = SandboxState::Destroyed;
        return Ok(());
      }
      SandboxState::Running => {
        if let Err(err) = self.stop() {
          // Force removal is the last thing left to try, the stop error stands regardless
          if self.remove_container() {
            self.state = SandboxState::Destroyed;
          }
          return Err(err);
        }
      }
      SandboxState::Stopped => {}
    }

    // The container can be removed by a later sweep
    self.remove_container();
    self.state = SandboxState::Destroyed;
    info!("Sandbox {} destroyed", self.name);
    Ok(())
  }

  /// Destroy and start again with the same configuration
  pub fn reset(&mut self) -> Result<()> {
    self.require_state(
      &[SandboxState::Unstarted, SandboxState::Running, SandboxState::Stopped],
      "reset",
    )?;
    self.destroy()?;
    self.state = SandboxState::Unstarted;
    self.start()
  }

  /// Stop and start the existing container, keeping its files
  pub fn restart(&mut self) -> Result<()> {
    self.require_state(&[SandboxState::Running, SandboxState::Stopped], "restart")?;
    self.stop()?;
    self.engine.start(&self.name, self.options.create_timeout)?;
    self.state = SandboxState::Running;
    info!("Sandbox {} restarted", self.name);
    Ok(())
  }

  fn container_spec(&self) -> ContainerSpec {
    ContainerSpec {
      name: self.name.clone(),
      image: self.options.image.clone(),
      env: self.options.env.clone(),
      pids_limit: self.options.pids_limit,
      memory_limit: self.options.memory_limit.clone(),
      cpu_core_limit: self.options.cpu_core_limit,
      allow_network_access: self.options.allow_network_access,
      command: vec!["/bin/bash".to_string(), self.main_process_script()],
    }
  }

  /// Everything after `create` that must succeed for the sandbox to be usable
  fn provision(&self) -> Result<()> {
    let setup_timeout = Some(self.options.setup_timeout);

    let mut script = tempfile::NamedTempFile::new()?;
    script.write_all(MAIN_PROCESS_SCRIPT)?;
    script.flush()?;
    self
      .engine
      .copy_in(&self.name, script.path(), &self.main_process_script(), setup_timeout)?;

    self.engine.start(&self.name, self.options.create_timeout)?;

    let mut helpers = vec![(&self.options.runner_bin, RUNNER_PATH)];
    if self.options.reap_mode == ReapMode::Container {
      helpers.push((&self.options.reaper_bin, REAPER_PATH));
    }
    for (source, dest) in helpers {
      self.engine.copy_in(&self.name, source, dest, setup_timeout)?;
      self.engine.exec_checked(
        &self.name,
        vec!["chmod".to_string(), "555".to_string(), dest.to_string()],
        setup_timeout,
      )?;
    }
    Ok(())
  }

  fn stop_container(&self) -> Result<()> {
    let timeout = Some(self.options.teardown_timeout);
    let err = match self.engine.stop(&self.name, self.options.stop_grace_period, timeout) {
      Ok(()) => return Ok(()),
      Err(err) => err,
    };

    warn!("Stopping sandbox {} fails: {}, reaping and retrying", self.name, err);
    self.reaper.reap(&self.main_process_script());

    self
      .engine
      .stop(&self.name, self.options.stop_retry_grace_period, timeout)
      .map_err(|retry| {
        error!("Sandbox {} cannot be stopped: {}", self.name, retry);
        SandboxError::critical(format!(
          "Container {} could not be stopped after reaping ({}), it may still be running",
          self.name, retry
        ))
      })
  }

  /// Returns whether the container is gone
  fn remove_container(&self) -> bool {
    match self.engine.remove(&self.name, Some(self.options.teardown_timeout)) {
      Ok(()) => true,
      Err(err) => {
        error!("Removing container {} fails: {}", self.name, err);
        false
      }
    }
  }

  fn remove_half_created(&self) {
    if let Err(err) = self.engine.remove(&self.name, Some(self.options.teardown_timeout)) {
      warn!("Removing half-created container {} fails: {}", self.name, err);
    }
  }
}
