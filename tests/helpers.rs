use std::io::Cursor;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use gradebox::protocol::{read_frame, RunnerFrame};
use gradebox::reaper::{descendants, find_process, list_processes};
use log::info;

mod common;

const RUNNER: &str = env!("CARGO_BIN_EXE_gradebox-runner");
const REAP: &str = env!("CARGO_BIN_EXE_gradebox-reap");

fn token() -> String {
  format!("gradebox-it-{}", uuid::Uuid::new_v4().simple())
}

/// Run `gradebox-runner` as the current user and decode its frame
fn run_runner(flags: &[&str], argv: &[&str]) -> RunnerFrame {
  let id = token();
  let output = Command::new(RUNNER)
    .args(["--cmd-id", id.as_str(), "--as-root", "--stdin-devnull"])
    .args(flags)
    .arg("--")
    .args(argv)
    .stdin(Stdio::null())
    .output()
    .unwrap();
  assert!(
    output.status.success(),
    "runner failed: {}",
    String::from_utf8_lossy(&output.stderr)
  );
  read_frame(&mut Cursor::new(output.stdout)).unwrap()
}

#[test]
fn it_should_frame_echo_hello() {
  common::setup();
  let frame = run_runner(&[], &["echo", "hello"]);
  assert_eq!(frame.report.cmd_args, vec!["echo", "hello"]);
  assert_eq!(frame.report.return_code, Some(0));
  assert!(!frame.report.timed_out);
  assert_eq!(frame.stdout, b"hello\n");
  assert!(frame.stderr.is_empty());
}

#[test]
fn it_should_time_out_sleep() {
  common::setup();
  let now = Instant::now();
  let frame = run_runner(&["--timeout", "1"], &["sleep", "10"]);
  assert!(frame.report.timed_out);
  assert_eq!(frame.report.return_code, None);
  assert!(now.elapsed() < Duration::from_secs(8));
}

#[test]
fn it_should_keep_invalid_utf8_through_truncation() {
  common::setup();
  let frame = run_runner(
    &["--truncate-stdout", "3", "--truncate-stderr", "10"],
    &["sh", "-c", "printf 'a\\377\\376zz'; printf 'e\\377' >&2"],
  );
  assert_eq!(frame.stdout, b"a\xff\xfe");
  assert!(frame.report.stdout_truncated);
  assert_eq!(frame.stderr, b"e\xff");
  assert!(!frame.report.stderr_truncated);
}

#[test]
fn it_should_report_missing_programs_as_127() {
  common::setup();
  let frame = run_runner(&[], &["/gradebox/no/such/program"]);
  assert_eq!(frame.report.return_code, Some(127));
}

#[test]
fn it_should_reject_a_missing_command() {
  common::setup();
  let output = Command::new(RUNNER)
    .args(["--cmd-id", "x", "--as-root"])
    .output()
    .unwrap();
  assert!(!output.status.success());
  assert!(output.stdout.is_empty());
}

#[test]
fn it_should_reap_children_from_the_command_line() {
  common::setup();
  let token = token();
  let mut parent = Command::new("sh")
    .args(["-c", "sleep 60 & sleep 60 & wait", token.as_str()])
    .spawn()
    .unwrap();
  sleep(Duration::from_millis(300));

  let found = find_process(&token, &[]).unwrap();
  let children = descendants(&list_processes().unwrap(), found.pid);
  assert_eq!(children.len(), 2);

  let status = Command::new(REAP)
    .args(["--grace", "1", token.as_str()])
    .status()
    .unwrap();
  assert!(status.success());

  parent.wait().unwrap();
  info!("Reaped {:?} below {}", children, found.pid);
  let remaining = list_processes().unwrap();
  for pid in children {
    assert!(remaining.iter().all(|info| info.pid != pid || info.zombie));
  }
}

#[test]
fn it_should_succeed_when_nothing_matches() {
  common::setup();
  let status = Command::new(REAP).arg(token()).status().unwrap();
  assert!(status.success());
}
