//! SSH shell transport
//!
//! Opens sessions to replication peers by shelling out to the system `ssh`
//! client, authenticated non-interactively through `sshpass -e`. Every
//! `exec` is a separate `ssh` invocation against the same target.

use crate::domain::ports::{CommandOutput, RemoteSession, RemoteTarget, RemoteTransport};
use crate::error::{Error, Result};
use crate::replication::config::SshConfig;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Exit status `ssh` reserves for its own failures
const SSH_FAILURE_EXIT: i32 = 255;

/// Default SSH port when `dial_addr` carries none
const DEFAULT_SSH_PORT: &str = "22";

/// Split `host:port`, defaulting the port
pub fn split_dial_addr(dial_addr: &str) -> (&str, &str) {
    match dial_addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.is_empty() => (host, port),
        _ => (dial_addr, DEFAULT_SSH_PORT),
    }
}

/// Transport spawning `sshpass -e ssh ...` per command
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    config: SshConfig,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteSession>> {
        let mut session = SshSession {
            config: self.config.clone(),
            target: target.clone(),
        };

        // probe so unreachable hosts and bad credentials fail at connect time
        let probe = session.exec("true").await?;
        if !probe.is_success() {
            return Err(Error::Transport {
                host: target.dial_addr.clone(),
                reason: probe.combined(),
            });
        }

        debug!("Opened ssh session to {} ({})", target.label, target.dial_addr);
        Ok(Box::new(session))
    }
}

/// Session bound to one remote target
pub struct SshSession {
    config: SshConfig,
    target: RemoteTarget,
}

impl SshSession {
    fn command(&self, remote_command: &str) -> Command {
        let (host, port) = split_dial_addr(&self.target.dial_addr);
        let strict = if self.config.strict_host_key_checking {
            "yes"
        } else {
            "no"
        };

        let mut cmd = Command::new(&self.config.sshpass_bin);
        cmd.arg("-e")
            .arg(&self.config.ssh_bin)
            .args(["-o", &format!("StrictHostKeyChecking={}", strict)])
            .args([
                "-o",
                &format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            ])
            .args(["-o", "BatchMode=no"]);
        if !self.config.strict_host_key_checking {
            cmd.args(["-o", "UserKnownHostsFile=/dev/null"]);
        }
        cmd.args(["-p", port])
            .arg(format!("{}@{}", self.target.username, host))
            .arg("--")
            .arg(remote_command)
            .env("SSHPASS", self.target.password.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        debug!("[{}] exec: {}", self.target.label, command);

        let output = self
            .command(command)
            .output()
            .await
            .map_err(|e| Error::Transport {
                host: self.target.dial_addr.clone(),
                reason: format!("failed to spawn {}: {}", self.config.sshpass_bin, e),
            })?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if result.exit_code == Some(SSH_FAILURE_EXIT) || result.exit_code.is_none() {
            return Err(Error::Transport {
                host: self.target.dial_addr.clone(),
                reason: result.combined(),
            });
        }
        Ok(result)
    }

    async fn close(&mut self) -> Result<()> {
        // nothing persistent to tear down between invocations
        Ok(())
    }
}
