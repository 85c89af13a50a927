use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == 0
    }

    /// Tail of stderr surfaced in user-facing errors.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let collected: Vec<&str> = self.stderr.lines().collect();
        let start = collected.len().saturating_sub(lines);
        collected[start..].join("\n")
    }
}

/// Execute a program and capture stdout/stderr.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or the I/O streams
/// cannot be read entirely.
pub fn run_command(
    program: &Path,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Result<RunOutput> {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.current_dir(cwd);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let output = command
        .output()
        .with_context(|| format!("failed to start {}", program.display()))?;
    Ok(RunOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        timed_out: false,
    })
}

/// Execute with a wall-clock timeout. On expiry the child is killed and the
/// partial output is returned with `timed_out` set.
pub fn run_command_with_timeout(
    program: &Path,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
    timeout: Duration,
) -> Result<RunOutput> {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.current_dir(cwd);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {}", program.display()))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let out_reader = thread::spawn(move || read_all(stdout));
    let err_reader = thread::spawn(move || read_all(stderr));

    let started = Instant::now();
    let timed_out = loop {
        match child.try_wait().context("failed to poll child process")? {
            Some(_) => break false,
            None if started.elapsed() >= timeout => {
                child.kill().ok();
                child.wait().ok();
                break true;
            }
            None => thread::sleep(Duration::from_millis(25)),
        }
    };

    let status = child.wait().context("failed to reap child process")?;
    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();
    Ok(RunOutput {
        code: status.code().unwrap_or(-1),
        stdout,
        stderr,
        timed_out,
    })
}

fn read_all(mut stream: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn captures_output_and_status() -> Result<()> {
        let output = run_command(
            Path::new("/bin/sh"),
            &[
                "-c".to_string(),
                "printf out && printf err >&2; exit 7".to_string(),
            ],
            &[],
            Path::new("."),
        )?;
        assert_eq!(output.code, 7);
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
        assert!(!output.timed_out);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_child() -> Result<()> {
        let output = run_command_with_timeout(
            Path::new("/bin/sh"),
            &["-c".to_string(), "sleep 30".to_string()],
            &[],
            Path::new("."),
            Duration::from_millis(200),
        )?;
        assert!(output.timed_out);
        Ok(())
    }

    #[test]
    fn stderr_tail_takes_last_lines() {
        let output = RunOutput {
            code: 1,
            stdout: String::new(),
            stderr: "one\ntwo\nthree".to_string(),
            timed_out: false,
        };
        assert_eq!(output.stderr_tail(2), "two\nthree");
        assert_eq!(output.stderr_tail(10), "one\ntwo\nthree");
    }
}
