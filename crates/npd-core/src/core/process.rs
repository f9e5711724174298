use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Execute a program and capture stdout/stderr.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or the I/O streams
/// cannot be read entirely.
pub fn run_command(program: &Path, args: &[String], cwd: &Path) -> Result<RunOutput> {
    let mut command = Command::new(program);
    command.args(args);
    command.current_dir(cwd);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let output = command
        .output()
        .with_context(|| format!("failed to start {}", program.display()))?;
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Ok(RunOutput {
        code,
        stdout,
        stderr,
    })
}

/// Execute a program, streaming each stdout/stderr line into tracing as it
/// arrives. Long pnpm installs keep producing output for minutes; buffering
/// it all would hide progress and can deadlock on full pipes.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or waited on.
pub fn run_command_streaming(program: &Path, args: &[String], cwd: &Path) -> Result<RunOutput> {
    let mut command = Command::new(program);
    command.args(args);
    command.current_dir(cwd);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {}", program.display()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let label = program
        .file_name()
        .map_or_else(|| program.display().to_string(), |name| {
            name.to_string_lossy().to_string()
        });

    let stdout_thread = spawn_line_reader(stdout, label.clone());
    let stderr_thread = spawn_line_reader(stderr, label);

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {}", program.display()))?;

    let stdout = join_lines(stdout_thread);
    let stderr = join_lines(stderr_thread);

    Ok(RunOutput {
        code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

fn spawn_line_reader<R: Read + Send + 'static>(
    stream: Option<R>,
    label: String,
) -> Option<thread::JoinHandle<Vec<String>>> {
    let stream = stream?;
    Some(thread::spawn(move || {
        let mut lines = Vec::new();
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            debug!(command = %label, "{line}");
            lines.push(line);
        }
        lines
    }))
}

fn join_lines(handle: Option<thread::JoinHandle<Vec<String>>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let lines = handle.join().unwrap_or_default();
    if lines.is_empty() {
        String::new()
    } else {
        let mut joined = lines.join("\n");
        joined.push('\n');
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_captures_output_and_status() -> Result<()> {
        let output = run_command(
            Path::new("/bin/sh"),
            &[
                "-c".to_string(),
                "printf out && printf err >&2; exit 7".to_string(),
            ],
            Path::new("."),
        )?;
        assert_eq!(output.code, 7);
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
        assert!(!output.success());
        Ok(())
    }

    #[test]
    fn run_command_streaming_collects_lines() -> Result<()> {
        let output = run_command_streaming(
            Path::new("/bin/sh"),
            &["-c".to_string(), "echo one; echo two".to_string()],
            Path::new("."),
        )?;
        assert!(output.success());
        assert_eq!(output.stdout, "one\ntwo\n");
        Ok(())
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = run_command(
            Path::new("/definitely/not/a/binary"),
            &[],
            Path::new("."),
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
