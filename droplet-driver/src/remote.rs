use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use droplet_common::{DriverError, Result};
use droplet_providers::retry::retry_transient;
use droplet_providers::BackoffPolicy;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit status ssh uses for its own failures (refused, unreachable, auth).
pub const SSH_CONNECTION_ERROR: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Channel used to run a shell script on a workspace VM.
///
/// Implementations return `Transient` for connectivity failures and `Ok` for any
/// completed run, whatever its exit code.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run_script(&self, address: &str, script: &str) -> Result<ExecOutput>;
}

/// `ssh -i <key> <user>@<address> bash -s` with the script on stdin, so nothing
/// sensitive shows up on argv.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    pub user: String,
    pub private_key_file: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run_script(&self, address: &str, script: &str) -> Result<ExecOutput> {
        let clean_ip = address.split('/').next().unwrap_or(address);
        let target = format!("{}@{}", self.user, clean_ip);
        // Project scripts manage systemd units.
        let remote_command = if self.user == "root" { "bash -s" } else { "sudo -n bash -s" };
        let started = Instant::now();

        let mut child = Command::new("ssh")
            .arg("-i")
            .arg(&self.private_key_file)
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(&target)
            .arg(remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::RemoteCommand {
                operation: "ssh".into(),
                exit_code: None,
                stderr: format!("ssh spawn failed: {e}"),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| DriverError::transient("ssh", format!("{target}: writing script: {e}")))?;
        }

        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DriverError::transient("ssh", format!("{target}: wait failed: {e}")));
            }
            Err(_) => {
                tracing::warn!("[ssh] {} timed out after {:?}", target, self.command_timeout);
                return Err(DriverError::transient(
                    "ssh",
                    format!("{target}: timed out after {:?}", self.command_timeout),
                ));
            }
        };

        let out = ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        tracing::debug!(
            "[ssh] {} exit={:?} in {:?}",
            target,
            out.exit_code,
            started.elapsed()
        );

        if out.exit_code == Some(SSH_CONNECTION_ERROR) {
            return Err(DriverError::transient(
                "ssh",
                format!("{target}: connection failed: {}", tail_str(&out.stderr, 500)),
            ));
        }
        Ok(out)
    }
}

/// Run a script, retrying connectivity failures, and turn a non-zero exit into
/// `RemoteCommand`.
pub async fn run_checked(
    executor: &dyn RemoteExecutor,
    policy: &BackoffPolicy,
    operation: &str,
    address: &str,
    script: &str,
) -> Result<ExecOutput> {
    let out = retry_transient(policy, operation, || executor.run_script(address, script)).await?;
    if !out.success() {
        tracing::error!(
            "[ssh] {} on {} failed (exit={:?})",
            operation,
            address,
            out.exit_code
        );
        return Err(DriverError::RemoteCommand {
            operation: operation.to_string(),
            exit_code: out.exit_code,
            stderr: tail_str(&out.stderr, 2000),
        });
    }
    Ok(out)
}

/// Quote for a POSIX shell: `'...'` with embedded quotes spliced in.
pub fn sh_escape_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

pub fn tail_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    // Keep last max_chars characters (best effort for UTF-8).
    s.chars().rev().take(max_chars).collect::<String>().chars().rev().collect()
}
