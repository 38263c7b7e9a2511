//! Remote execution over SSH
//!
//! Thin wrapper around the system `ssh` binary used by targets, monitors and
//! recipe collectors to run commands on cluster nodes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::executor::RetryingCall;

/// How nodes are reached over SSH
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SshConfig {
    /// Login user; a cluster's own `ssh-user` takes precedence
    pub username: String,
    pub private_key_path: Option<PathBuf>,
    pub port: u16,

    /// Passed to ssh as `ConnectTimeout`
    pub timeout_secs: u64,

    pub strict_host_key_checking: bool,

    /// Attempts made by `exec_with_retry`
    pub retries: u32,

    /// Delay between attempts, and between checks of `wait_for_ssh`
    pub retry_delay_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: "cephuser".to_string(),
            private_key_path: None,
            port: 22,
            timeout_secs: 30,
            strict_host_key_checking: false,
            retries: 3,
            retry_delay_secs: 5,
        }
    }
}

impl SshConfig {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Why one remote attempt did not succeed
#[derive(Debug, Error)]
enum Attempt {
    #[error("{0:#}")]
    Transport(anyhow::Error),
    #[error("exit code {}", .0.exit_code)]
    Exit(CommandOutput),
}

/// Runs commands on cluster nodes through the system `ssh` binary
#[derive(Clone, Debug, Default)]
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Same settings with a different login user
    pub fn for_user(&self, username: Option<&str>) -> Self {
        let mut client = self.clone();
        if let Some(user) = username {
            client.config.username = user.to_string();
        }
        client
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn options(&self) -> Vec<String> {
        let checking = if self.config.strict_host_key_checking {
            "yes"
        } else {
            "no"
        };
        [
            format!("StrictHostKeyChecking={checking}"),
            "UserKnownHostsFile=/dev/null".to_string(),
            format!("ConnectTimeout={}", self.config.timeout_secs),
            "BatchMode=yes".to_string(),
            "LogLevel=ERROR".to_string(),
        ]
        .into_iter()
        .flat_map(|option| ["-o".to_string(), option])
        .collect()
    }

    /// Arguments of `ssh` for running `command` on `host`
    fn command_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = self.options();
        args.extend(["-p".to_string(), self.config.port.to_string()]);
        if let Some(key) = &self.config.private_key_path {
            args.extend(["-i".to_string(), key.display().to_string()]);
        }
        args.push(format!("{}@{}", self.config.username, host));
        args.push(command.to_string());
        args
    }

    /// Run `command` on `host` once
    pub async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput> {
        debug!("ssh {}@{}: {}", self.config.username, host, command);
        let output = Command::new("ssh")
            .args(self.command_args(host, command))
            .output()
            .await
            .with_context(|| format!("Failed to run ssh to {host}"))?;
        Ok(CommandOutput::from(output))
    }

    /// Run `command` until it exits 0 or the configured attempts run out.
    /// The output of the last attempt is returned even when it failed.
    pub async fn exec_with_retry(&self, host: &str, command: &str) -> Result<CommandOutput> {
        let always = |_: &Attempt| true;
        let retry = RetryingCall::new(self.config.retries, self.config.retry_delay(), always);
        let outcome = retry
            .call(|| async {
                match self.exec(host, command).await {
                    Ok(output) if output.is_success() => Ok(output),
                    Ok(output) => Err(Attempt::Exit(output)),
                    Err(e) => Err(Attempt::Transport(e)),
                }
            })
            .await;

        match outcome {
            Ok(output) | Err(Attempt::Exit(output)) => Ok(output),
            Err(Attempt::Transport(e)) => Err(e),
        }
    }

    /// True when `host` accepts a login and runs a trivial command
    pub async fn test_connection(&self, host: &str) -> Result<bool> {
        let output = self.exec(host, "echo connected").await?;
        if !output.is_success() {
            debug!("{} refused the connection check: {}", host, output.stderr.trim_end());
        }
        Ok(output.is_success() && output.stdout.trim() == "connected")
    }

    /// Poll `host` until it answers or `limit` elapses
    pub async fn wait_for_ssh(&self, host: &str, limit: Duration) -> bool {
        let poll = async {
            loop {
                match self.test_connection(host).await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => debug!("Probe of {} failed: {:#}", host, e),
                }
                sleep(self.config.retry_delay()).await;
            }
        };
        match timeout(limit, poll).await {
            Ok(()) => true,
            Err(_) => {
                warn!("{} did not answer over SSH within {}s", host, limit.as_secs());
                false
            }
        }
    }
}

/// Output of a local or remote command
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,

    /// -1 when the process was killed by a signal
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        }
    }
}

/// Run a shell command on the controlling host
pub async fn exec_local(command: &str) -> Result<CommandOutput> {
    debug!("sh -c {}", command);
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .context("Failed to execute local command")?;
    Ok(CommandOutput::from(output))
}
