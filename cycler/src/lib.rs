// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A reset/power-cycling engine for hardware platform validation.
//!
//! `cycler` drives a System Under Test (SUT) through power-state transitions
//! (warm and cold resets, graceful and surprise S5/G3, S3 sleep, S4
//! hibernate, IPMI chassis cycles), classifies every attempt into a
//! [`ResetStatus`], runs hardware health checks after each successful boot
//! and records every cycle in an append-only CSV ledger.
//!
//! The SUT operating system, the power controller, the post-code reader and
//! the silicon debug probe are external collaborators behind the traits in
//! [`sut`]; [`CyclingCampaign`] ties them together into the cycle loop.

mod campaign;
pub mod clock;
pub mod config;
mod cycle;
pub mod diagnostics;
mod engine;
mod error;
mod handlers;
pub mod health;
mod logging;
mod status;
pub mod summary;
pub mod sut;

pub use campaign::CampaignReport;
pub use campaign::CyclingCampaign;
pub use campaign::StopReason;
pub use cycle::Cycle;
pub use cycle::CycleRecord;
pub use cycle::Recovery;
pub use engine::ResetEngine;
pub use error::CycleError;
pub use handlers::FailureClass;
pub use handlers::NextStep;
pub use logging::CycleLogSource;
pub use logging::try_init_tracing;
pub use status::BootFlow;
pub use status::OsFamily;
pub use status::PostCode;
pub use status::PostCodeReading;
pub use status::PowerState;
pub use status::ResetKind;
pub use status::ResetStatus;

use jiff::Timestamp;
use std::io::Read;
use std::process::Command;
use std::process::Output;
use std::process::Stdio;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Failure of a command run on the controller host.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The process could not be started.
    #[error("failed to launch host command")]
    Launch(#[from] std::io::Error),
    /// The process exited unsuccessfully; carries its stderr.
    #[error("host command failed ({0}): {1}")]
    Command(std::process::ExitStatus, String),
    /// Stdout was not UTF-8.
    #[error("host command output is not utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    /// The process was killed at its deadline.
    #[error("host command timed out after {0:?}")]
    Timeout(Duration),
}

/// Run `cmd` to completion and return its trimmed stdout. A non-zero exit
/// status is an error.
pub fn run_host_cmd(mut cmd: Command) -> Result<String, CommandError> {
    cmd.stderr(Stdio::piped()).stdin(Stdio::null());
    let cmd_debug = format!("{cmd:?}");

    let start = Timestamp::now();
    let output = cmd.output()?;
    let elapsed = start.duration_until(Timestamp::now());

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    ::tracing::debug!(
        cmd = cmd_debug,
        status = %output.status,
        stderr,
        elapsed = format_args!("{:.3}s", elapsed.as_secs_f64()),
        "host command finished"
    );
    if !output.status.success() {
        return Err(CommandError::Command(output.status, stderr));
    }
    Ok(String::from_utf8(output.stdout)?.trim().to_owned())
}

/// Run a command on the host and return its raw output, killing it if it
/// runs longer than `timeout`. A non-zero exit status is not an error.
pub fn run_host_cmd_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<Output, CommandError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let cmd_debug = format!("{cmd:?}");
    ::tracing::debug!(cmd = cmd_debug, ?timeout, "executing command");

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().map(drain_pipe);
    let stderr = child.stderr.take().map(drain_pipe);

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            if let Err(e) = child.kill() {
                ::tracing::warn!(cmd = cmd_debug, ?e, "failed to kill timed out command");
            }
            // Reap the child; its exit status is irrelevant after a kill.
            let _ = child.wait();
            return Err(CommandError::Timeout(timeout));
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    let output = Output {
        status,
        stdout: join_pipe(stdout),
        stderr: join_pipe(stderr),
    };
    ::tracing::debug!(
        cmd = cmd_debug,
        stdout_str = %String::from_utf8_lossy(&output.stdout),
        stderr_str = %String::from_utf8_lossy(&output.stderr),
        "command exited in {:.3}s with status {}",
        start.elapsed().as_secs_f64(),
        output.status
    );
    Ok(output)
}

fn drain_pipe(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            ::tracing::debug!(?e, "failed to drain command pipe");
        }
        buf
    })
}

fn join_pipe(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default()
}
