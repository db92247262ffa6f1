// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces to the System Under Test and the hardware around it.
//!
//! The engine only talks to the SUT through these traits. Concrete
//! implementations drive host tools: [`ssh::SshSut`] for the OS,
//! [`ipmi::IpmiPowerControl`] for chassis power and the probe commands in
//! [`probe`] for post codes and silicon debug.

pub mod ipmi;
pub mod probe;
pub mod ssh;

#[cfg(test)]
pub(crate) mod fake;

use crate::OsFamily;
use crate::PostCodeReading;
use crate::PowerState;
use crate::diagnostics::DumpDomain;
use std::path::Path;
use std::time::Duration;

/// Result of a shell command run on the SUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status of the command.
    pub status: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// The operating system running on the SUT.
pub trait SutOs {
    /// Family of the OS, which selects sleep commands and health tooling.
    fn os_family(&self) -> OsFamily;

    /// Run a shell command on the SUT and wait up to `timeout` for it.
    fn execute(&mut self, cmd: &str, timeout: Duration) -> anyhow::Result<CommandOutput>;

    /// Launch a command on the SUT without waiting for it to finish. Used
    /// for commands that take the OS down with them.
    fn spawn_detached(&mut self, cmd: &str) -> anyhow::Result<()>;

    /// Whether the OS is up and accepting commands.
    fn is_alive(&mut self) -> bool;

    /// Request an OS reboot. The connection is usually lost mid-command, so
    /// callers should treat errors as informational.
    fn reboot(&mut self) -> anyhow::Result<()>;

    /// Request an OS shutdown.
    fn shutdown(&mut self) -> anyhow::Result<()>;

    /// Run a command and return its trimmed stdout, failing on a non-zero
    /// exit status.
    fn execute_stdout(&mut self, cmd: &str, timeout: Duration) -> anyhow::Result<String> {
        let output = self.execute(cmd, timeout)?;
        if !output.success() {
            anyhow::bail!(
                "`{cmd}` exited with status {}: {}",
                output.status,
                output.stderr.trim()
            );
        }
        Ok(output.stdout.trim().to_owned())
    }
}

/// DC and AC power control of the SUT platform.
pub trait PowerControl {
    /// Press the power button for `press` to turn the SUT on.
    fn dc_power_on(&mut self, press: Duration) -> anyhow::Result<bool>;
    /// Hold the power button for `press` to turn the SUT off.
    fn dc_power_off(&mut self, press: Duration) -> anyhow::Result<bool>;
    /// Press the reset button.
    fn dc_power_reset(&mut self) -> anyhow::Result<()>;
    /// Cycle chassis power through the BMC.
    fn power_cycle(&mut self) -> anyhow::Result<()>;
    /// Restore AC power and wait `settle` for the rails.
    fn ac_power_on(&mut self, settle: Duration) -> anyhow::Result<bool>;
    /// Remove AC power and wait `settle` for the rails to drain.
    fn ac_power_off(&mut self, settle: Duration) -> anyhow::Result<bool>;
    /// Whether AC power is currently applied.
    fn ac_power_state(&mut self) -> anyhow::Result<bool>;
    /// The current system power state.
    fn power_state(&mut self) -> anyhow::Result<PowerState>;
}

/// Reader for the platform POST code display.
pub trait PostCodeReader {
    /// Read the current post code, or `None` if the platform has no post
    /// code source.
    fn read(&mut self) -> anyhow::Result<Option<PostCodeReading>>;
}

/// Use this when the platform has no post code source.
pub struct NoPostCodes;

impl PostCodeReader for NoPostCodes {
    fn read(&mut self) -> anyhow::Result<Option<PostCodeReading>> {
        Ok(None)
    }
}

/// Processor and memory inventory as seen by the silicon debug probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInventory {
    /// Populated sockets.
    pub sockets: u32,
    /// Enabled cores across all sockets.
    pub cores: u32,
    /// Enabled hardware threads across all sockets.
    pub threads: u32,
    /// Installed physical memory in MiB.
    pub memory_mib: u64,
}

/// A text report the silicon debug probe can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugReport {
    /// A diagnostic dump for one domain.
    Dump(DumpDomain),
    /// The UPI topology summary.
    UpiTopology,
    /// UPI per-port link speed and power state.
    UpiLinkSpeed,
    /// PCIe LTSSM and error status.
    PcieErrors,
}

/// Silicon debug access (register reads, halts, dumps) to the SUT CPUs.
pub trait SiliconDebug {
    /// Number of sockets the probe can see.
    fn socket_count(&mut self) -> anyhow::Result<u32>;
    /// Read a register by its dotted path on one socket.
    fn read_register(&mut self, socket: u32, path: &str) -> anyhow::Result<u64>;
    /// Write a register by its dotted path on one socket.
    fn write_register(&mut self, socket: u32, path: &str, value: u64) -> anyhow::Result<()>;
    /// Produce a text report.
    fn capture(&mut self, report: DebugReport) -> anyhow::Result<String>;
    /// Processor and memory inventory.
    fn inventory(&mut self) -> anyhow::Result<PlatformInventory>;
    /// Halt all threads.
    fn halt(&mut self) -> anyhow::Result<()>;
    /// Resume all threads.
    fn resume(&mut self) -> anyhow::Result<()>;
    /// Arm or disarm the break-on-machine-check trap.
    fn set_machine_check_break(&mut self, enabled: bool) -> anyhow::Result<()>;
    /// Run trace analyzers for a post code hang and store their logs in
    /// `dir`.
    fn collect_analyzer_logs(
        &mut self,
        analyzers: &[String],
        post_code: crate::PostCode,
        dir: &Path,
    ) -> anyhow::Result<()>;
}

/// Use this when no silicon debug probe is attached.
pub struct NoSiliconDebug;

impl SiliconDebug for NoSiliconDebug {
    fn socket_count(&mut self) -> anyhow::Result<u32> {
        anyhow::bail!("no silicon debug probe attached")
    }

    fn read_register(&mut self, _socket: u32, path: &str) -> anyhow::Result<u64> {
        anyhow::bail!("no silicon debug probe attached to read {path}")
    }

    fn write_register(&mut self, _socket: u32, path: &str, _value: u64) -> anyhow::Result<()> {
        anyhow::bail!("no silicon debug probe attached to write {path}")
    }

    fn capture(&mut self, report: DebugReport) -> anyhow::Result<String> {
        anyhow::bail!("no silicon debug probe attached to capture {report:?}")
    }

    fn inventory(&mut self) -> anyhow::Result<PlatformInventory> {
        anyhow::bail!("no silicon debug probe attached")
    }

    fn halt(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("no silicon debug probe attached")
    }

    fn resume(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("no silicon debug probe attached")
    }

    fn set_machine_check_break(&mut self, _enabled: bool) -> anyhow::Result<()> {
        anyhow::bail!("no silicon debug probe attached")
    }

    fn collect_analyzer_logs(
        &mut self,
        _analyzers: &[String],
        _post_code: crate::PostCode,
        _dir: &Path,
    ) -> anyhow::Result<()> {
        anyhow::bail!("no silicon debug probe attached")
    }
}

/// Everything the engine needs to reach the SUT.
pub struct Sut {
    /// The SUT operating system.
    pub os: Box<dyn SutOs>,
    /// Platform power control.
    pub power: Box<dyn PowerControl>,
    /// POST code source.
    pub post_codes: Box<dyn PostCodeReader>,
    /// Silicon debug probe.
    pub silicon: Box<dyn SiliconDebug>,
}

impl Sut {
    /// A SUT without post codes or a silicon debug probe.
    pub fn new(os: Box<dyn SutOs>, power: Box<dyn PowerControl>) -> Self {
        Self {
            os,
            power,
            post_codes: Box::new(NoPostCodes),
            silicon: Box::new(NoSiliconDebug),
        }
    }

    /// Use `reader` as the post code source.
    pub fn with_post_codes(mut self, reader: Box<dyn PostCodeReader>) -> Self {
        self.post_codes = reader;
        self
    }

    /// Use `probe` for silicon debug access.
    pub fn with_silicon_debug(mut self, probe: Box<dyn SiliconDebug>) -> Self {
        self.silicon = probe;
        self
    }

    /// Read the current post code, treating read errors as "unavailable".
    pub fn read_post_code(&mut self) -> Option<PostCodeReading> {
        match self.post_codes.read() {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!(
                    error = e.as_ref() as &dyn std::error::Error,
                    "failed to read post code"
                );
                None
            }
        }
    }
}
