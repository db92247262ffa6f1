// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Post code and silicon debug access through site-provided host commands.
//!
//! Labs front their debug hardware with different tools, so both readers run
//! a configured program and speak a small text protocol on its stdout.

use super::DebugReport;
use super::PlatformInventory;
use super::PostCodeReader;
use super::SiliconDebug;
use crate::PostCode;
use crate::PostCodeReading;
use crate::config::Named;
use crate::config::ProbeCommand;
use crate::run_host_cmd;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::process::Command;

fn probe_command(command: &[String]) -> anyhow::Result<Command> {
    let (program, args) = command.split_first().context("empty probe command")?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Reads post codes from a command printing `BIOS=<hex> [FPGA=<hex>]` or a
/// bare hex code. Empty output means no post code is available.
pub struct CommandPostCodeReader {
    command: Vec<String>,
}

impl CommandPostCodeReader {
    /// Build from configuration.
    pub fn from_config(config: &ProbeCommand) -> Self {
        Self {
            command: config.command.clone(),
        }
    }
}

impl PostCodeReader for CommandPostCodeReader {
    fn read(&mut self) -> anyhow::Result<Option<PostCodeReading>> {
        let output = run_host_cmd(probe_command(&self.command)?)?;
        parse_post_code(&output)
    }
}

fn parse_post_code(output: &str) -> anyhow::Result<Option<PostCodeReading>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(None);
    }

    let mut bios = None;
    let mut fpga = None;
    for field in output.split_whitespace() {
        match field.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("bios") => {
                bios = Some(value.parse::<PostCode>()?);
            }
            Some((key, value)) if key.eq_ignore_ascii_case("fpga") => {
                fpga = Some(value.parse::<PostCode>()?);
            }
            Some((key, _)) => anyhow::bail!("unknown post code field `{key}`"),
            None if bios.is_none() => bios = Some(field.parse::<PostCode>()?),
            None => anyhow::bail!("unexpected post code output `{output}`"),
        }
    }

    let bios = bios.with_context(|| format!("no BIOS post code in `{output}`"))?;
    Ok(Some(PostCodeReading { bios, fpga }))
}

/// Silicon debug access through a probe command with sub-verbs:
///
/// | verb | output |
/// |------|--------|
/// | `sockets` | socket count |
/// | `read <socket> <path>` | register value (hex with `0x` or decimal) |
/// | `write <socket> <path> <value>` | nothing |
/// | `capture <report>` | report text |
/// | `inventory` | JSON `{"sockets","cores","threads","memory_mib"}` |
/// | `halt`, `resume`, `mcbreak on\|off` | nothing |
/// | `analyze <post code> <dir> <analyzer>...` | nothing |
pub struct CommandSiliconDebug {
    command: Vec<String>,
}

impl CommandSiliconDebug {
    /// Build from configuration.
    pub fn from_config(config: &ProbeCommand) -> Self {
        Self {
            command: config.command.clone(),
        }
    }

    fn run<I, S>(&self, args: I) -> anyhow::Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = probe_command(&self.command)?;
        cmd.args(args);
        Ok(run_host_cmd(cmd)?)
    }
}

fn report_name(report: DebugReport) -> &'static str {
    match report {
        DebugReport::Dump(domain) => domain.name(),
        DebugReport::UpiTopology => "upi_topology",
        DebugReport::UpiLinkSpeed => "upi_link_speed",
        DebugReport::PcieErrors => "pcie_errors",
    }
}

/// Parse a register value printed as `0x` hex or decimal.
pub(crate) fn parse_register_value(text: &str) -> anyhow::Result<u64> {
    let text = text.trim();
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => text.parse(),
    };
    value.with_context(|| format!("`{text}` is not a register value"))
}

#[derive(Deserialize)]
struct InventoryReply {
    sockets: u32,
    cores: u32,
    threads: u32,
    memory_mib: u64,
}

impl SiliconDebug for CommandSiliconDebug {
    fn socket_count(&mut self) -> anyhow::Result<u32> {
        let output = self.run(["sockets"])?;
        output
            .parse()
            .with_context(|| format!("`{output}` is not a socket count"))
    }

    fn read_register(&mut self, socket: u32, path: &str) -> anyhow::Result<u64> {
        parse_register_value(&self.run(["read", socket.to_string().as_str(), path])?)
            .with_context(|| format!("failed to read {path} on socket {socket}"))
    }

    fn write_register(&mut self, socket: u32, path: &str, value: u64) -> anyhow::Result<()> {
        self.run(["write", socket.to_string().as_str(), path, format!("{value:#x}").as_str()])?;
        Ok(())
    }

    fn capture(&mut self, report: DebugReport) -> anyhow::Result<String> {
        self.run(["capture", report_name(report)])
    }

    fn inventory(&mut self) -> anyhow::Result<PlatformInventory> {
        let reply: InventoryReply = serde_json::from_str(&self.run(["inventory"])?)
            .context("malformed inventory reply")?;
        Ok(PlatformInventory {
            sockets: reply.sockets,
            cores: reply.cores,
            threads: reply.threads,
            memory_mib: reply.memory_mib,
        })
    }

    fn halt(&mut self) -> anyhow::Result<()> {
        self.run(["halt"]).map(drop)
    }

    fn resume(&mut self) -> anyhow::Result<()> {
        self.run(["resume"]).map(drop)
    }

    fn set_machine_check_break(&mut self, enabled: bool) -> anyhow::Result<()> {
        self.run(["mcbreak", if enabled { "on" } else { "off" }])
            .map(drop)
    }

    fn collect_analyzer_logs(
        &mut self,
        analyzers: &[String],
        post_code: PostCode,
        dir: &Path,
    ) -> anyhow::Result<()> {
        let mut cmd = probe_command(&self.command)?;
        cmd.arg("analyze")
            .arg(post_code.to_string())
            .arg(dir)
            .args(analyzers);
        run_host_cmd(cmd)?;
        Ok(())
    }
}
