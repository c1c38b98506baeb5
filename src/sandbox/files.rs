use std::path::{Path, PathBuf};

use log::info;
use path_absolutize::Absolutize;

use crate::command::CommandSpec;
use crate::config::{SANDBOX_USERNAME, SANDBOX_WORKING_DIR};
use crate::error::{Result, SandboxError};
use crate::sandbox::{FileOwner, Sandbox, SandboxState};

impl Sandbox {
  /// Copy host files into the working directory. Relative paths are
  /// resolved against the current directory.
  pub fn add_files<P: AsRef<Path>>(&mut self, paths: &[P], owner: FileOwner, read_only: bool) -> Result<()> {
    self.require_state(&[SandboxState::Running], "add files to")?;

    let mut targets = vec![];
    for path in paths {
      let source = absolute(path.as_ref())?;
      let file_name = source
        .file_name()
        .ok_or_else(|| SandboxError::usage(format!("{} has no file name", source.display())))?
        .to_string_lossy()
        .to_string();
      self
        .engine
        .copy_in(&self.name, &source, SANDBOX_WORKING_DIR, Some(self.options.setup_timeout))?;
      targets.push(format!("{}/{}", SANDBOX_WORKING_DIR, file_name));
    }
    if targets.is_empty() {
      return Ok(());
    }
    info!("Added {} to sandbox {}", targets.join(" "), self.name);

    if owner == FileOwner::Sandbox {
      self.chown_files(&targets)?;
    }
    if read_only {
      let mut args = vec!["chmod".to_string(), "444".to_string()];
      args.extend(targets);
      self.run_setup_command(args)?;
    }
    Ok(())
  }

  /// Copy one host file into the working directory under `new_name`
  pub fn add_and_rename_file<P: AsRef<Path>>(&mut self, path: P, new_name: &str) -> Result<()> {
    self.require_state(&[SandboxState::Running], "add files to")?;
    if new_name.is_empty() || new_name.contains('/') {
      return Err(SandboxError::usage(format!("Invalid file name {:?}", new_name)));
    }

    let source = absolute(path.as_ref())?;
    let target = format!("{}/{}", SANDBOX_WORKING_DIR, new_name);
    self
      .engine
      .copy_in(&self.name, &source, &target, Some(self.options.setup_timeout))?;
    self.chown_files(&[target])
  }

  fn chown_files(&mut self, targets: &[String]) -> Result<()> {
    let mut args = vec![
      "chown".to_string(),
      format!("{}:{}", SANDBOX_USERNAME, SANDBOX_USERNAME),
    ];
    args.extend(targets.iter().cloned());
    self.run_setup_command(args)
  }

  fn run_setup_command(&mut self, args: Vec<String>) -> Result<()> {
    let spec = CommandSpec::new(args)
      .as_root(true)
      .timeout(Some(self.options.setup_timeout.as_secs()))
      .check(true);
    self.run_command(spec)?;
    Ok(())
  }
}

fn absolute(path: &Path) -> Result<PathBuf> {
  Ok(path.absolutize()?.to_path_buf())
}
