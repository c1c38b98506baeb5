//! Result framing between `gradebox-runner` and the controller.
//!
//! The runner's stdout carries exactly one frame:
//!
//! ```text
//! <metadata-length>\n<metadata-json><stdout-length>\n<stdout-bytes><stderr-length>\n<stderr-bytes>
//! ```
//!
//! Every length is the exact byte count of what follows it, so command output
//! may contain anything, including invalid UTF-8 or text that looks like JSON.

use std::io::{self, BufRead, Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Metadata record emitted ahead of the captured streams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerReport {
  pub cmd_args: Vec<String>,
  pub return_code: Option<i32>,
  pub timed_out: bool,
  pub stdout_truncated: bool,
  pub stderr_truncated: bool,
}

/// A fully decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerFrame {
  pub report: RunnerReport,
  pub stdout: Vec<u8>,
  pub stderr: Vec<u8>,
}

pub fn write_report<W: Write>(w: &mut W, report: &RunnerReport) -> Result<()> {
  let json = serde_json::to_vec(report)
    .map_err(|e| SandboxError::protocol(format!("Encode runner report fails: {}", e)))?;
  writeln!(w, "{}", json.len())?;
  w.write_all(&json)?;
  Ok(())
}

/// Write `len` bytes from `reader` as one length-prefixed stream.
/// The reader must hold at least `len` bytes.
pub fn write_stream<W: Write, R: Read>(w: &mut W, reader: R, len: u64) -> Result<()> {
  writeln!(w, "{}", len)?;
  let copied = io::copy(&mut reader.take(len), w)?;
  if copied != len {
    return Err(SandboxError::protocol(format!(
      "Stream ended after {} of {} bytes",
      copied, len
    )));
  }
  Ok(())
}

pub fn read_frame<R: BufRead>(r: &mut R) -> Result<RunnerFrame> {
  let report = read_chunk(r, "metadata")?;
  let report: RunnerReport = serde_json::from_slice(&report)
    .map_err(|e| SandboxError::protocol(format!("Decode runner report fails: {}", e)))?;
  let stdout = read_chunk(r, "stdout")?;
  let stderr = read_chunk(r, "stderr")?;
  Ok(RunnerFrame {
    report,
    stdout,
    stderr,
  })
}

fn read_chunk<R: BufRead>(r: &mut R, what: &str) -> Result<Vec<u8>> {
  let mut line = Vec::new();
  r.read_until(b'\n', &mut line)?;
  if line.pop() != Some(b'\n') {
    return Err(SandboxError::protocol(format!("Missing {} length line", what)));
  }
  let len = std::str::from_utf8(&line)
    .ok()
    .and_then(|text| text.trim().parse::<u64>().ok())
    .ok_or_else(|| {
      SandboxError::protocol(format!(
        "Invalid {} length: {:?}",
        what,
        String::from_utf8_lossy(&line)
      ))
    })?;

  let mut buf = Vec::new();
  r.take(len).read_to_end(&mut buf)?;
  if buf.len() as u64 != len {
    return Err(SandboxError::protocol(format!(
      "Expected {} bytes of {}, got {}",
      len,
      what,
      buf.len()
    )));
  }
  Ok(buf)
}
