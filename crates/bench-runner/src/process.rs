use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch {0}: {1}")]
    Launch(String, #[source] std::io::Error),
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct CmdOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_tail(&self) -> String {
        String::from_utf8_lossy(&self.stderr)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string()
    }
}

pub fn ssh_command(host: &str, remote: &str) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg(host).arg(remote);
    cmd
}

fn command_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn spawn_reader<R: Read + Send + 'static>(src: Option<R>) -> Option<thread::JoinHandle<Vec<u8>>> {
    src.map(|mut r| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            buf
        })
    })
}

pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<CmdOutput, ProcessError> {
    let name = command_name(&cmd);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| ProcessError::Launch(name, e))?;

    // Drain pipes on threads so a chatty child cannot fill the pipe buffer
    // while we poll for exit.
    let out_reader = spawn_reader(child.stdout.take());
    let err_reader = spawn_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = out_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = err_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    match status {
        Some(status) => Ok(CmdOutput {
            status: status.code(),
            stdout,
            stderr,
        }),
        None => Err(ProcessError::TimedOut(timeout)),
    }
}

pub fn run_redirected(
    mut cmd: Command,
    log_path: &Path,
    timeout: Duration,
) -> Result<Option<i32>, ProcessError> {
    let name = command_name(&cmd);
    let log = File::create(log_path)?;
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(log.try_clone()?));
    cmd.stderr(Stdio::from(log));
    let mut child = cmd.spawn().map_err(|e| ProcessError::Launch(name, e))?;

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.code());
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessError::TimedOut(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_exit_status_and_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let out = run_with_timeout(cmd, Duration::from_secs(10)).expect("run");
        assert_eq!(out.status, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout_text().trim(), "out");
        assert_eq!(out.stderr_tail(), "err");
    }

    #[test]
    fn kills_on_deadline() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = Instant::now();
        let err = run_with_timeout(cmd, Duration::from_millis(300)).expect_err("must time out");
        assert!(matches!(err, ProcessError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn redirects_output_to_file() {
        let dir = std::env::temp_dir().join(format!("bench_proc_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let log_path = dir.join("redirect.log");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo captured");
        let status = run_redirected(cmd, &log_path, Duration::from_secs(10)).expect("run");
        assert_eq!(status, Some(0));
        let content = std::fs::read_to_string(&log_path).expect("log");
        assert_eq!(content.trim(), "captured");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_binary_reports_launch_error() {
        let cmd = Command::new("definitely-not-a-binary-bench");
        let err = run_with_timeout(cmd, Duration::from_secs(1)).expect_err("must fail");
        assert!(matches!(err, ProcessError::Launch(_, _)));
    }
}
