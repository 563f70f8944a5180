//! Host bootstrap seam: SSH reachability, bootstrap execution, tailnet
//! discovery.
//!
//! The bootstrap script itself is an external collaborator; this module only
//! transfers and runs it. The default implementation shells out to the
//! system `ssh`/`scp` binaries with the configured key pair. Worker tests
//! substitute a mock.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("bootstrap transfer failed: {0}")]
    Transfer(String),

    #[error("bootstrap script exited with status {0}")]
    NonZeroExit(i32),

    #[error("bootstrap execution failed: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, BootstrapError>;

#[async_trait]
pub trait BootstrapRunner: Send + Sync {
    /// One no-op SSH probe. The worker loops this with its own deadline and
    /// heartbeats.
    async fn probe_ssh(&self, ip: &str) -> bool;

    /// Transfer the bootstrap artifact and execute it with the given
    /// environment. Non-zero exit is fatal.
    async fn run_bootstrap(&self, ip: &str, env: &[(String, String)]) -> Result<()>;

    /// Best-effort tailnet DNS name discovery. `None` on any failure.
    async fn discover_tailnet_host(&self, ip: &str) -> Option<String>;
}

/// Default runner: system `ssh`/`scp` with a configured private key.
pub struct OpenSshRunner {
    private_key_path: PathBuf,
    script_path: PathBuf,
    connect_timeout: Duration,
}

const REMOTE_SCRIPT_PATH: &str = "/root/clawctl-bootstrap.sh";

impl OpenSshRunner {
    pub fn new(private_key_path: PathBuf, script_path: PathBuf) -> Self {
        Self {
            private_key_path,
            script_path,
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn ssh_command(&self, ip: &str) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-i")
            .arg(&self.private_key_path)
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg(format!("root@{ip}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

/// Quote a value for a POSIX shell env assignment.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl BootstrapRunner for OpenSshRunner {
    async fn probe_ssh(&self, ip: &str) -> bool {
        let mut command = self.ssh_command(ip);
        command.arg("true");
        matches!(command.status().await, Ok(status) if status.success())
    }

    async fn run_bootstrap(&self, ip: &str, env: &[(String, String)]) -> Result<()> {
        let mut scp = Command::new("scp");
        scp.arg("-i")
            .arg(&self.private_key_path)
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.script_path)
            .arg(format!("root@{ip}:{REMOTE_SCRIPT_PATH}"))
            .stdin(Stdio::null());

        let status = scp.status().await.map_err(|e| BootstrapError::Transfer(e.to_string()))?;
        if !status.success() {
            return Err(BootstrapError::Transfer(format!("scp exited with {status}")));
        }

        // Minimal environment: only what the script needs, quoted, never
        // logged.
        let assignments: Vec<String> = env.iter().map(|(k, v)| format!("{k}={}", shell_quote(v))).collect();
        let remote = format!("env {} bash {REMOTE_SCRIPT_PATH}", assignments.join(" "));

        let mut command = self.ssh_command(ip);
        command.arg(remote);
        let output = command.output().await.map_err(|e| BootstrapError::Execution(e.to_string()))?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr_tail: String = String::from_utf8_lossy(&output.stderr).chars().rev().take(300).collect::<String>().chars().rev().collect();
            tracing::warn!(code, stderr_tail = %stderr_tail, "Bootstrap script failed");
            return Err(BootstrapError::NonZeroExit(code));
        }

        Ok(())
    }

    async fn discover_tailnet_host(&self, ip: &str) -> Option<String> {
        let mut command = self.ssh_command(ip);
        command.arg("tailscale status --json");
        let output = command.output().await.ok()?;
        if !output.status.success() {
            return None;
        }

        let status: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        let dns_name = status.pointer("/Self/DNSName")?.as_str()?;
        let dns_name = dns_name.trim_end_matches('.');
        if dns_name.is_empty() {
            return None;
        }
        Some(format!("https://{dns_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        // A quoted value never leaks a bare dollar expansion
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }
}
