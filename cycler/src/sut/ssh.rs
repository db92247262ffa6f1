// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SUT OS access over the OpenSSH client.

use super::CommandOutput;
use super::SutOs;
use crate::CommandError;
use crate::OsFamily;
use crate::config::SutConfig;
use crate::run_host_cmd_with_timeout;
use anyhow::Context;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

/// Delay inserted before a detached command runs, so the SSH session that
/// launched it can exit cleanly first.
const DETACH_DELAY_SECS: u32 = 2;

/// A SUT reached with `ssh` in batch mode.
pub struct SshSut {
    host: String,
    user: String,
    port: u16,
    identity_file: Option<PathBuf>,
    os: OsFamily,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshSut {
    /// Build from configuration.
    pub fn from_config(config: &SutConfig) -> Self {
        Self {
            host: config.host.clone(),
            user: config.user.clone(),
            port: config.port,
            identity_file: config.identity_file.clone(),
            os: config.os,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    fn ssh(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg("-p")
            .arg(self.port.to_string());
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.user, self.host))
            .arg(remote_cmd);
        cmd
    }

    fn detached(&self, remote_cmd: &str) -> String {
        detached_command(self.os, remote_cmd)
    }
}

/// Wrap `cmd` so it keeps running after the SSH session ends.
fn detached_command(os: OsFamily, cmd: &str) -> String {
    match os {
        OsFamily::Windows => format!(
            "start \"\" /B cmd /c \"timeout /t {DETACH_DELAY_SECS} /nobreak >nul & {cmd}\""
        ),
        OsFamily::Linux | OsFamily::Other => {
            let inner = format!("sleep {DETACH_DELAY_SECS}; {cmd}");
            format!(
                "nohup sh -c {} >/dev/null 2>&1 &",
                shell_words::quote(&inner)
            )
        }
    }
}

impl SutOs for SshSut {
    fn os_family(&self) -> OsFamily {
        self.os
    }

    fn execute(&mut self, cmd: &str, timeout: Duration) -> anyhow::Result<CommandOutput> {
        let output = run_host_cmd_with_timeout(self.ssh(cmd), timeout + self.connect_timeout)
            .with_context(|| format!("failed to run `{cmd}` on {}", self.host))?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8(output.stdout).map_err(CommandError::from)?,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn_detached(&mut self, cmd: &str) -> anyhow::Result<()> {
        let wrapped = self.detached(cmd);
        let output = self.execute(&wrapped, self.command_timeout)?;
        if !output.success() {
            anyhow::bail!(
                "failed to launch `{cmd}` (status {}): {}",
                output.status,
                output.stderr.trim()
            );
        }
        tracing::debug!(cmd, "launched detached command");
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.execute("echo alive", Duration::from_secs(5)) {
            Ok(output) => output.success() && output.stdout.contains("alive"),
            Err(e) => {
                tracing::debug!(
                    host = self.host,
                    error = e.as_ref() as &dyn std::error::Error,
                    "liveness probe failed"
                );
                false
            }
        }
    }

    fn reboot(&mut self) -> anyhow::Result<()> {
        let cmd = match self.os {
            OsFamily::Linux => "systemctl reboot",
            OsFamily::Windows => "shutdown /r /t 0",
            OsFamily::Other => "reboot",
        };
        self.spawn_detached(cmd)
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        let cmd = match self.os {
            OsFamily::Linux => "systemctl poweroff",
            OsFamily::Windows => "shutdown /s /t 0",
            OsFamily::Other => "poweroff",
        };
        self.spawn_detached(cmd)
    }
}
