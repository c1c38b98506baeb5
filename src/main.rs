use std::env;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};
use log::info;

use gradebox::utils::default_format;
use gradebox::{
  CommandSpec, CommandStdin, CompletedCommand, FileOwner, Result, RunnerExit, Sandbox, SandboxOptions,
};

/// Exit status reported when the command timed out, as timeout(1) does
const EXIT_TIMED_OUT: u8 = 124;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[arg(long, help = "Container name, random when omitted")]
  name: Option<String>,

  #[arg(long, help = "Docker image")]
  image: Option<String>,

  #[arg(long, help = "Docker memory limit, e.g. 256m")]
  memory: Option<String>,

  #[arg(long, help = "Maximum number of processes in the container")]
  pids: Option<u64>,

  #[arg(long, help = "CPU cores available to the container")]
  cpus: Option<f64>,

  #[arg(long, default_value_t = false, help = "Allow network access")]
  network: bool,

  #[arg(short, long, value_parser = parse_env_pair, help = "Environment variable KEY=VALUE")]
  env: Vec<(String, String)>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  #[command(about = "Run one command in a fresh sandbox")]
  Run {
    #[arg(short, long, help = "Time limit in seconds")]
    timeout: Option<u64>,

    #[arg(long, default_value_t = false)]
    as_root: bool,

    #[arg(long, default_value_t = false)]
    block_process_spawn: bool,

    #[arg(long, help = "Stack size limit in bytes")]
    max_stack_size: Option<u64>,

    #[arg(long, help = "Virtual memory limit in bytes")]
    max_virtual_memory: Option<u64>,

    #[arg(long)]
    truncate_stdout: Option<u64>,

    #[arg(long)]
    truncate_stderr: Option<u64>,

    #[arg(long, help = "File passed to the command's stdin")]
    stdin: Option<PathBuf>,

    #[arg(short, long, help = "File copied into the working directory")]
    file: Vec<PathBuf>,

    #[arg(long, default_value = "autograder", help = "Owner of copied files: autograder or root")]
    owner: String,

    #[arg(long, default_value_t = false, help = "Make copied files read only")]
    read_only: bool,

    #[arg(long, default_value_t = false, help = "Fail unless the command exits with 0")]
    check: bool,

    #[arg(last = true, required = true, help = "Command and arguments")]
    args: Vec<String>,
  },
}

fn parse_env_pair(text: &str) -> std::result::Result<(String, String), String> {
  match text.split_once('=') {
    Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
    _ => Err(format!("expected KEY=VALUE, got {}", text)),
  }
}

impl Cli {
  fn options(&self) -> Result<SandboxOptions> {
    let mut options = SandboxOptions::from_env()?;
    if let Some(name) = &self.name {
      options.name(name.clone());
    }
    if let Some(image) = &self.image {
      options.image(image.clone());
    }
    if let Some(memory) = &self.memory {
      options.memory_limit(memory.clone());
    }
    if let Some(pids) = self.pids {
      options.pids_limit(pids);
    }
    if self.cpus.is_some() {
      options.cpu_core_limit(self.cpus);
    }
    options.allow_network_access(self.network);
    for (key, value) in &self.env {
      options.env(key.clone(), value.clone());
    }
    Ok(options)
  }
}

fn exit_status(completed: &CompletedCommand) -> u8 {
  match completed.return_code {
    None => EXIT_TIMED_OUT,
    Some(code) if (0..=255).contains(&code) => code as u8,
    Some(code) if code < 0 => (128 - code).min(255) as u8,
    Some(_) => 1,
  }
}

fn run(cli: Cli) -> Result<u8> {
  let options = cli.options()?;
  let Commands::Run {
    timeout,
    as_root,
    block_process_spawn,
    max_stack_size,
    max_virtual_memory,
    truncate_stdout,
    truncate_stderr,
    stdin,
    file,
    owner,
    read_only,
    check,
    args,
  } = cli.command;

  let owner: FileOwner = owner.parse()?;
  let stdin = match stdin {
    Some(path) => CommandStdin::File(File::open(path)?),
    None => CommandStdin::Closed,
  };
  let spec = CommandSpec::new(args)
    .timeout(timeout)
    .as_root(as_root)
    .block_process_spawn(block_process_spawn)
    .max_stack_size(max_stack_size)
    .max_virtual_memory(max_virtual_memory)
    .truncate_stdout(truncate_stdout)
    .truncate_stderr(truncate_stderr)
    .stdin(stdin)
    .check(check);

  let completed = Sandbox::scoped(options, |sandbox| {
    info!("Sandbox {} started", sandbox.name());
    sandbox.add_files(file.as_slice(), owner, read_only)?;
    sandbox.run_command(spec)
  })?;

  io::stdout().write_all(&completed.stdout)?;
  io::stdout().flush()?;
  io::stderr().write_all(&completed.stderr)?;
  Ok(exit_status(&completed))
}

fn init_logger() -> Result<LoggerHandle> {
  let handle = Logger::try_with_str("gradebox=info")?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
        .basename("gradebox")
        .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
        .suppress_timestamp(),
    )
    .append()
    .duplicate_to_stderr(Duplicate::Warn)
    .format_for_files(default_format)
    .start()?;
  Ok(handle)
}

fn main() -> RunnerExit {
  let cli = Cli::parse();

  let _logger = match init_logger() {
    Ok(handle) => handle,
    Err(err) => return RunnerExit::Err(err),
  };

  info!("Start running gradebox");

  match run(cli) {
    Ok(0) => RunnerExit::Ok,
    Ok(code) => RunnerExit::Code(code),
    Err(err) => RunnerExit::Err(err),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn completed(return_code: Option<i32>) -> CompletedCommand {
    CompletedCommand {
      return_code,
      timed_out: return_code.is_none(),
      stdout: vec![],
      stderr: vec![],
      stdout_truncated: false,
      stderr_truncated: false,
    }
  }

  #[test]
  fn it_should_map_results_to_exit_status() {
    assert_eq!(exit_status(&completed(Some(0))), 0);
    assert_eq!(exit_status(&completed(Some(3))), 3);
    assert_eq!(exit_status(&completed(Some(-9))), 137);
    assert_eq!(exit_status(&completed(None)), 124);
  }

  #[test]
  fn it_should_parse_the_run_subcommand() {
    let cli = Cli::try_parse_from([
      "gradebox", "--memory", "256m", "-e", "LANG=C", "run", "-t", "2", "-f", "a.cpp", "--", "ls", "-l",
    ])
    .unwrap();
    assert_eq!(cli.memory.as_deref(), Some("256m"));
    assert_eq!(cli.env, vec![("LANG".to_string(), "C".to_string())]);
    let Commands::Run { timeout, file, args, .. } = cli.command;
    assert_eq!(timeout, Some(2));
    assert_eq!(file, vec![PathBuf::from("a.cpp")]);
    assert_eq!(args, vec!["ls", "-l"]);
  }

  #[test]
  fn it_should_reject_malformed_env_pairs() {
    assert!(parse_env_pair("=x").is_err());
    assert!(parse_env_pair("novalue").is_err());
    assert_eq!(parse_env_pair("A=b=c").unwrap(), ("A".to_string(), "b=c".to_string()));
  }
}
