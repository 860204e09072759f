use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::SamplerSection;
use crate::process::{run_with_timeout, ssh_command};

const SSH_OP_TIMEOUT: Duration = Duration::from_secs(10);
const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(60);

pub const SAMPLE_FILE: &str = "energy_samples.csv";

#[derive(Debug, Clone)]
pub struct SamplerHandle {
    pub pid: String,
    pub scratch_dir: String,
}

pub struct EnergySampler {
    host: String,
    command: String,
    scratch_prefix: String,
    grace: Duration,
}

impl EnergySampler {
    pub fn new(cfg: &SamplerSection, host: &str) -> Self {
        Self {
            host: host.to_string(),
            command: cfg.command.clone(),
            scratch_prefix: cfg.scratch_prefix.clone(),
            grace: Duration::from_secs(cfg.grace_seconds),
        }
    }

    // Failure to start is never fatal; the trial continues without energy
    // metrics.
    pub fn start(&self, namespace: &str) -> Option<SamplerHandle> {
        let scratch_dir = format!("{}{}", self.scratch_prefix, namespace);
        let mkdir = ssh_command(&self.host, &format!("mkdir -p {}", scratch_dir));
        match run_with_timeout(mkdir, SSH_OP_TIMEOUT) {
            Ok(out) if out.success() => {}
            Ok(out) => {
                warn!(scratch_dir = %scratch_dir, stderr = %out.stderr_tail(), "sampler scratch dir setup failed");
                return None;
            }
            Err(e) => {
                warn!(scratch_dir = %scratch_dir, error = %e, "sampler scratch dir setup failed");
                return None;
            }
        }

        // The sampler outlives the ssh session; the echoed PID is the only
        // handle we keep.
        let launch = format!(
            "nohup {} -o {}/{} --summary sleep 99999 > /dev/null 2>&1 & echo $!",
            self.command, scratch_dir, SAMPLE_FILE
        );
        match run_with_timeout(ssh_command(&self.host, &launch), SSH_OP_TIMEOUT) {
            Ok(out) if out.success() => match parse_pid(&out.stdout_text()) {
                Some(pid) => {
                    info!(pid = %pid, scratch_dir = %scratch_dir, "energy sampler started");
                    Some(SamplerHandle { pid, scratch_dir })
                }
                None => {
                    warn!(scratch_dir = %scratch_dir, "energy sampler did not report a pid");
                    None
                }
            },
            Ok(out) => {
                warn!(stderr = %out.stderr_tail(), "energy sampler failed to start");
                None
            }
            Err(e) => {
                warn!(error = %e, "energy sampler failed to start");
                None
            }
        }
    }

    // Scratch removal is unconditional and independent of retrieval success.
    pub fn stop(&self, handle: &SamplerHandle, dest: &Path) -> bool {
        let term = ssh_command(&self.host, &format!("kill -TERM {}", handle.pid));
        if let Err(e) = run_with_timeout(term, SSH_OP_TIMEOUT) {
            warn!(pid = %handle.pid, error = %e, "failed to signal energy sampler");
        }
        // Grace period for the sampler to flush its summary.
        thread::sleep(self.grace);

        let mut retrieved = false;
        let cat = ssh_command(
            &self.host,
            &format!("cat {}/{}", handle.scratch_dir, SAMPLE_FILE),
        );
        match run_with_timeout(cat, RETRIEVE_TIMEOUT) {
            Ok(out) if out.success() && !out.stdout.is_empty() => {
                match fs::write(dest, &out.stdout) {
                    Ok(()) => {
                        info!(bytes = out.stdout.len(), dest = %dest.display(), "energy samples retrieved");
                        retrieved = true;
                    }
                    Err(e) => {
                        warn!(dest = %dest.display(), error = %e, "failed to persist energy samples");
                    }
                }
            }
            Ok(out) => {
                warn!(stderr = %out.stderr_tail(), "failed to retrieve energy samples");
            }
            Err(e) => {
                warn!(error = %e, "failed to retrieve energy samples");
            }
        }

        self.remove_scratch(handle);
        retrieved
    }

    // Hard kill for end-of-trial cleanup when stop never ran.
    pub fn abort(&self, handle: &SamplerHandle) {
        let kill = ssh_command(&self.host, &format!("kill -9 {}", handle.pid));
        if let Err(e) = run_with_timeout(kill, SSH_OP_TIMEOUT) {
            warn!(pid = %handle.pid, error = %e, "failed to kill energy sampler");
        }
        self.remove_scratch(handle);
    }

    fn remove_scratch(&self, handle: &SamplerHandle) {
        let rm = ssh_command(&self.host, &format!("rm -rf {}", handle.scratch_dir));
        match run_with_timeout(rm, SSH_OP_TIMEOUT) {
            Ok(out) if out.success() => {}
            Ok(out) => {
                warn!(scratch_dir = %handle.scratch_dir, stderr = %out.stderr_tail(), "failed to remove sampler scratch dir")
            }
            Err(e) => {
                warn!(scratch_dir = %handle.scratch_dir, error = %e, "failed to remove sampler scratch dir")
            }
        }
    }
}

fn parse_pid(raw: &str) -> Option<String> {
    let pid = raw.trim();
    if !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()) {
        Some(pid.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_parsing_accepts_digits_only() {
        assert_eq!(parse_pid(" 4211\n"), Some("4211".to_string()));
        assert_eq!(parse_pid(""), None);
        assert_eq!(parse_pid("no sampler\n"), None);
        assert_eq!(parse_pid("42 11"), None);
    }
}
