//! Cross-platform subprocess execution with a wall-clock timeout, used to
//! invoke external credential helpers (§6a of the design doc) without shell
//! interpretation.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Run `program` with `args`, writing `stdin` if given, bounding the whole
/// invocation to `timeout` when set. The process is spawned directly
/// (`std::process::Command`); no shell is ever interposed.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args);

    let mut child = command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        pipe.write_all(input)
            .with_context(|| format!("failed to write to {program} stdin"))?;
    }

    let deadline = timeout.map(|d| Instant::now() + d);

    loop {
        match child.try_wait().context("failed to poll child process")? {
            Some(status) => {
                return Ok(collect_output(
                    &mut child,
                    status.code().unwrap_or(-1),
                    false,
                    start.elapsed(),
                ));
            }
            None => {
                if let Some(deadline) = deadline
                    && Instant::now() >= deadline
                {
                    let _ = child.kill();
                    let _ = child.wait();
                    let mut out = collect_output(&mut child, -1, true, start.elapsed());
                    out.stderr.push_str(&format!(
                        "\n{program} timed out after {}",
                        humantime::format_duration(timeout.unwrap())
                    ));
                    return Ok(out);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

fn collect_output(
    child: &mut std::process::Child,
    exit_code: i32,
    timed_out: bool,
    duration: Duration,
) -> CommandOutput {
    let mut stdout = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    CommandOutput {
        exit_code,
        stdout,
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_with_timeout_captures_stdout() {
        let out = run_with_timeout("echo", &["hello"], None, None).expect("spawn echo");
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
        assert_eq!(out.exit_code, 0);
        assert!(!out.timed_out);
    }

    #[test]
    fn run_with_timeout_pipes_stdin() {
        let out = run_with_timeout("cat", &[], Some(b"ping"), None).expect("spawn cat");
        assert_eq!(out.stdout, b"ping");
    }

    #[test]
    fn run_with_timeout_kills_on_deadline() {
        let out = run_with_timeout("sleep", &["5"], None, Some(Duration::from_millis(100)))
            .expect("spawn sleep");
        assert!(out.timed_out);
        assert!(out.duration < Duration::from_secs(5));
    }
}
