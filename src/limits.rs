use std::path::PathBuf;

use log::debug;
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{setgid, setgroups, setuid, Gid, Uid, User};

use crate::error::{Result, SandboxError};

/// Linux has no RLIMIT_VMEM, the address-space limit takes its place
const VIRTUAL_MEMORY_RESOURCE: Resource = Resource::RLIMIT_AS;

/// The fixed unprivileged account commands run as
#[derive(Debug, Clone)]
pub struct SandboxIdentity {
  name: String,
  uid: Uid,
  gid: Gid,
  home: PathBuf,
}

impl SandboxIdentity {
  pub fn lookup(name: &str) -> Result<Self> {
    let user = User::from_name(name)?
      .ok_or_else(|| SandboxError::runner(format!("User {} does not exist", name)))?;
    Ok(SandboxIdentity {
      name: user.name,
      uid: user.uid,
      gid: user.gid,
      home: user.dir,
    })
  }

  pub fn uid(&self) -> Uid {
    self.uid
  }

  pub fn gid(&self) -> Gid {
    self.gid
  }

  /// Variables that must describe this account rather than root
  pub fn env_overrides(&self) -> Vec<(String, String)> {
    let home = self.home.to_string_lossy().to_string();
    vec![
      ("HOME".to_string(), home),
      ("USER".to_string(), self.name.clone()),
      ("LOGNAME".to_string(), self.name.clone()),
      ("USERNAME".to_string(), self.name.clone()),
    ]
  }
}

/// Limits applied to one child between fork and exec
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
  pub(crate) credentials: Option<(Uid, Gid)>,
  pub(crate) block_process_spawn: bool,
  pub(crate) max_stack_size: Option<u64>,
  pub(crate) max_virtual_memory: Option<u64>,
}

impl ResourceLimits {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn run_as(mut self, identity: Option<&SandboxIdentity>) -> Self {
    self.credentials = identity.map(|id| (id.uid, id.gid));
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

  /// Runs in the forked child only. Must stay async-signal-safe: no
  /// allocation and no logging. Any error aborts the exec.
  pub fn apply(&self) -> nix::Result<()> {
    if let Some((uid, gid)) = self.credentials {
      drop_privileges(uid, gid)?;
    }
    if self.block_process_spawn {
      setrlimit(Resource::RLIMIT_NPROC, 0, 0)?;
    }
    if let Some(stack) = self.max_stack_size {
      setrlimit(Resource::RLIMIT_STACK, stack, stack)?;
    }
    if let Some(memory) = self.max_virtual_memory {
      setrlimit(VIRTUAL_MEMORY_RESOURCE, memory, memory)?;
    }
    Ok(())
  }

  pub(crate) fn log(&self) {
    debug!(
      "Child limits: credentials={:?}, block_process_spawn={}, stack={:?}, virtual_memory={:?}",
      self.credentials, self.block_process_spawn, self.max_stack_size, self.max_virtual_memory
    );
  }
}

/// Group must change before user: once the uid is dropped the process no
/// longer holds the privilege to change its groups.
pub fn drop_privileges(uid: Uid, gid: Gid) -> nix::Result<()> {
  setgroups(&[gid])?;
  setgid(gid)?;
  setuid(uid)?;
  Ok(())
}
