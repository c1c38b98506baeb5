//! Locating and killing process trees left behind by a command or a container.
//!
//! Processes are found by a token embedded in their command line. The matched
//! process itself is never signalled, only its descendants: it may be a
//! container's placeholder main process, which has to survive.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};

use crate::config::REAPER_PATH;
use crate::engine::{ContainerEngine, ExecRequest};
use crate::error::{Result, SandboxError};

/// Time between SIGTERM and SIGKILL
pub const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(3);

/// Called with the search token when reaping fails
pub type ReapHook = Arc<dyn Fn(&str, &SandboxError) + Send + Sync>;

/// Best-effort process tree cleanup. Never fails: errors are logged and
/// passed to the hook, if any.
pub trait Reaper: Send + Sync {
  fn reap(&self, token: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
  pub pid: Pid,
  pub ppid: Pid,
  pub zombie: bool,
  pub cmdline: Vec<String>,
}

/// Reaps through the /proc of the current PID namespace
pub struct HostReaper {
  proc_root: &'static str,
  grace: Duration,
  hook: Option<ReapHook>,
}

/// Reaps by running `gradebox-reap` inside a container's PID namespace
pub struct ContainerReaper {
  engine: Arc<dyn ContainerEngine>,
  container: String,
  timeout: Duration,
  hook: Option<ReapHook>,
}

impl HostReaper {
  pub fn new() -> Self {
    HostReaper {
      proc_root: "/proc",
      grace: DEFAULT_REAP_GRACE,
      hook: None,
    }
  }

  pub fn grace(mut self, grace: Duration) -> Self {
    self.grace = grace;
    self
  }

  pub fn on_failure(mut self, hook: ReapHook) -> Self {
    self.hook = Some(hook);
    self
  }

  /// Returns the number of descendants that were signalled
  pub fn try_reap(&self, token: &str) -> Result<usize> {
    let table = list_processes_in(Path::new(self.proc_root))?;
    let parent = match find_in(&table, token, &[]) {
      Some(parent) => parent,
      None => {
        debug!("No process matches {}", token);
        return Ok(0);
      }
    };
    info!("Reaping children of {} ({})", token, parent.cmdline.join(" "));
    kill_descendants(&table, parent.pid, self.grace)
  }
}

impl Default for HostReaper {
  fn default() -> Self {
    Self::new()
  }
}

impl Reaper for HostReaper {
  fn reap(&self, token: &str) {
    match self.try_reap(token) {
      Ok(count) => debug!("Reaped {} processes for {}", count, token),
      Err(err) => report_failure(&self.hook, token, &err),
    }
  }
}

impl ContainerReaper {
  pub fn new<NS: Into<String>>(engine: Arc<dyn ContainerEngine>, container: NS, timeout: Duration) -> Self {
    ContainerReaper {
      engine,
      container: container.into(),
      timeout,
      hook: None,
    }
  }

  pub fn on_failure(mut self, hook: ReapHook) -> Self {
    self.hook = Some(hook);
    self
  }

  fn try_reap(&self, token: &str) -> Result<()> {
    let request = ExecRequest::new(vec![REAPER_PATH.to_string(), token.to_string()]);
    let output = self.engine.exec_to_end(&self.container, request, Some(self.timeout))?;
    if output.status != 0 {
      return Err(SandboxError::engine(format!(
        "gradebox-reap exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
      )));
    }
    Ok(())
  }
}

impl Reaper for ContainerReaper {
  fn reap(&self, token: &str) {
    if let Err(err) = self.try_reap(token) {
      report_failure(&self.hook, token, &err);
    }
  }
}

fn report_failure(hook: &Option<ReapHook>, token: &str, err: &SandboxError) {
  warn!("Reaping processes for {} fails: {}", token, err);
  if let Some(hook) = hook {
    hook(token, err);
  }
}

/// Every process visible in /proc
pub fn list_processes() -> Result<Vec<ProcessInfo>> {
  list_processes_in(Path::new("/proc"))
}

fn list_processes_in(proc_root: &Path) -> Result<Vec<ProcessInfo>> {
  let mut table = vec![];
  for entry in fs::read_dir(proc_root)? {
    let entry = entry?;
    let pid = match entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) {
      Some(pid) => pid,
      None => continue,
    };
    // Processes exit while we scan
    if let Some(info) = read_process(&entry.path(), Pid::from_raw(pid)) {
      table.push(info);
    }
  }
  table.sort_by_key(|info| info.pid.as_raw());
  Ok(table)
}

fn read_process(dir: &Path, pid: Pid) -> Option<ProcessInfo> {
  let stat = fs::read_to_string(dir.join("stat")).ok()?;
  let (state, ppid) = parse_stat(&stat)?;
  let cmdline = fs::read(dir.join("cmdline")).ok()?;
  Some(ProcessInfo {
    pid,
    ppid,
    zombie: state == 'Z',
    cmdline: parse_cmdline(&cmdline),
  })
}

/// `pid (comm) state ppid ...`, where comm may itself contain spaces and parens
fn parse_stat(stat: &str) -> Option<(char, Pid)> {
  let rest = &stat[stat.rfind(')')? + 1..];
  let mut fields = rest.split_whitespace();
  let state = fields.next()?.chars().next()?;
  let ppid = fields.next()?.parse::<i32>().ok()?;
  Some((state, Pid::from_raw(ppid)))
}

fn parse_cmdline(raw: &[u8]) -> Vec<String> {
  raw
    .split(|b| *b == 0)
    .filter(|arg| !arg.is_empty())
    .map(|arg| String::from_utf8_lossy(arg).into_owned())
    .collect()
}

/// First live process whose arguments contain `token`, skipping this
/// process, `exclude`, and `docker exec` wrappers that merely echo the token.
pub fn find_process(token: &str, exclude: &[Pid]) -> Option<ProcessInfo> {
  let table = list_processes().ok()?;
  find_in(&table, token, exclude).cloned()
}

fn find_in<'a>(table: &'a [ProcessInfo], token: &str, exclude: &[Pid]) -> Option<&'a ProcessInfo> {
  let me = getpid();
  table.iter().find(|info| {
    info.pid != me
      && !exclude.contains(&info.pid)
      && !info.zombie
      && !is_exec_wrapper(&info.cmdline)
      && info.cmdline.iter().any(|arg| arg.contains(token))
  })
}

fn is_exec_wrapper(cmdline: &[String]) -> bool {
  let program = cmdline
    .first()
    .and_then(|arg0| Path::new(arg0).file_name())
    .and_then(|name| name.to_str());
  program == Some("docker") && cmdline.get(1).map(String::as_str) == Some("exec")
}

/// All processes below `root`, parents before children
pub fn descendants(table: &[ProcessInfo], root: Pid) -> Vec<Pid> {
  let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
  for info in table {
    children.entry(info.ppid).or_default().push(info.pid);
  }

  let mut found = vec![];
  let mut queue = VecDeque::from([root]);
  while let Some(pid) = queue.pop_front() {
    if let Some(kids) = children.get(&pid) {
      for kid in kids {
        if *kid != root && !found.contains(kid) {
          found.push(*kid);
          queue.push_back(*kid);
        }
      }
    }
  }
  found
}

/// SIGTERM every descendant of `parent`, wait up to `grace`, SIGKILL the rest
fn kill_descendants(table: &[ProcessInfo], parent: Pid, grace: Duration) -> Result<usize> {
  let me = getpid();
  if parent == me {
    return Err(SandboxError::runner("Refusing to reap the reaper's own process tree"));
  }

  let targets: Vec<Pid> = descendants(table, parent)
    .into_iter()
    .filter(|pid| *pid != me)
    .collect();
  if targets.is_empty() {
    return Ok(0);
  }

  for pid in &targets {
    debug!("Sending SIGTERM to {}", pid);
    signal(*pid, Signal::SIGTERM)?;
  }

  let deadline = Instant::now() + grace;
  let mut alive: Vec<Pid> = targets.clone();
  while !alive.is_empty() && Instant::now() < deadline {
    sleep(Duration::from_millis(50));
    alive.retain(|pid| is_alive(*pid));
  }

  for pid in &alive {
    debug!("Sending SIGKILL to {}", pid);
    signal(*pid, Signal::SIGKILL)?;
  }

  Ok(targets.len())
}

/// Processes may exit or be out of reach while we signal them
fn signal(pid: Pid, sig: Signal) -> Result<()> {
  match kill(pid, sig) {
    Ok(()) | Err(Errno::ESRCH) | Err(Errno::EPERM) => Ok(()),
    Err(err) => Err(err.into()),
  }
}

fn is_alive(pid: Pid) -> bool {
  let stat = match fs::read_to_string(format!("/proc/{}/stat", pid)) {
    Ok(stat) => stat,
    Err(_) => return false,
  };
  !matches!(parse_stat(&stat), Some(('Z', _)) | None)
}

#[cfg(test)]
mod tests {
  use std::process::{Child, Command};

  use super::*;

  fn info(pid: i32, ppid: i32, cmdline: &[&str]) -> ProcessInfo {
    ProcessInfo {
      pid: Pid::from_raw(pid),
      ppid: Pid::from_raw(ppid),
      zombie: false,
      cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
    }
  }

  fn token() -> String {
    format!("gradebox-test-{}", uuid::Uuid::new_v4().simple())
  }

  fn spawn_tree(token: &str) -> Child {
    // The parent holds the token, two generations of sleepers hang below it
    let script = "sleep 60 & sh -c 'sleep 60 & wait' & wait";
    Command::new("sh")
      .args(["-c", script, token])
      .spawn()
      .unwrap()
  }

  #[test]
  fn it_should_parse_stat_with_odd_comm() {
    let stat = "1234 (my (weird) prog) S 77 1234 1234 0 -1";
    assert_eq!(parse_stat(stat), Some(('S', Pid::from_raw(77))));
    assert_eq!(parse_stat("garbage"), None);
  }

  #[test]
  fn it_should_split_cmdline_on_nul() {
    assert_eq!(parse_cmdline(b"sh\0-c\0echo hi\0"), vec!["sh", "-c", "echo hi"]);
    assert!(parse_cmdline(b"").is_empty());
  }

  #[test]
  fn it_should_skip_exec_wrappers_and_excluded() {
    let table = vec![
      info(10, 1, &["docker", "exec", "-i", "box", "gradebox-runner", "--cmd-id", "tok"]),
      info(11, 1, &["/usr/bin/docker", "exec", "box", "tok"]),
      info(12, 1, &["gradebox-reap", "tok"]),
      info(13, 1, &["gradebox-runner", "--cmd-id", "xxtokxx", "--", "sleep"]),
    ];
    let found = find_in(&table, "tok", &[Pid::from_raw(12)]).unwrap();
    assert_eq!(found.pid, Pid::from_raw(13));
    assert!(find_in(&table, "nothing", &[]).is_none());
  }

  #[test]
  fn it_should_walk_descendants_without_root() {
    let table = vec![
      info(1, 0, &["init"]),
      info(2, 1, &["runner"]),
      info(3, 2, &["child"]),
      info(4, 3, &["grandchild"]),
      info(5, 1, &["unrelated"]),
    ];
    let found = descendants(&table, Pid::from_raw(2));
    assert_eq!(found, vec![Pid::from_raw(3), Pid::from_raw(4)]);
    assert!(descendants(&table, Pid::from_raw(4)).is_empty());
  }

  #[test]
  fn it_should_kill_descendants_but_not_the_match() {
    let token = token();
    let mut parent = spawn_tree(&token);
    sleep(Duration::from_millis(300));

    let table = list_processes().unwrap();
    let found = find_in(&table, &token, &[]).unwrap();
    assert_eq!(found.pid.as_raw() as u32, parent.id());
    let before = descendants(&table, found.pid);
    assert!(before.len() >= 3, "expected a process tree, got {:?}", before);

    let reaper = HostReaper::new().grace(Duration::from_secs(1));
    assert_eq!(reaper.try_reap(&token).unwrap(), before.len());

    // The matched process survives; its `wait` returns once the children are gone
    let status = parent.wait().unwrap();
    assert!(status.code().is_some());
    for pid in before {
      assert!(!is_alive(pid), "{} survived", pid);
    }
  }

  #[test]
  fn it_should_escalate_to_sigkill() {
    let token = token();
    let script = "sh -c 'trap \"\" TERM; while :; do sleep 1; done' & wait";
    let mut parent = Command::new("sh").args(["-c", script, &token]).spawn().unwrap();
    sleep(Duration::from_millis(300));

    let reaper = HostReaper::new().grace(Duration::from_millis(300));
    assert!(reaper.try_reap(&token).unwrap() >= 1);
    parent.wait().unwrap();
  }

  #[test]
  fn it_should_never_raise_and_call_the_hook() {
    let calls = Arc::new(std::sync::Mutex::new(vec![]));
    let seen = calls.clone();
    let reaper = HostReaper {
      proc_root: "/gradebox-no-such-proc",
      grace: DEFAULT_REAP_GRACE,
      hook: None,
    }
    .on_failure(Arc::new(move |token: &str, _: &SandboxError| {
      seen.lock().unwrap().push(token.to_string());
    }));
    reaper.reap("tok");
    assert_eq!(*calls.lock().unwrap(), vec!["tok".to_string()]);

    // Nothing matches: not an error
    HostReaper::new().reap(&token());
  }

  #[test]
  fn it_should_not_match_itself() {
    let me = getpid();
    let table = list_processes().unwrap();
    let own = table.iter().find(|info| info.pid == me).unwrap();
    let own_arg = own.cmdline[0].clone();
    if let Some(found) = find_in(&table, &own_arg, &[]) {
      assert_ne!(found.pid, me);
    }
    assert!(kill_descendants(&table, me, Duration::from_millis(10)).is_err());
  }
}
