// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform power control through `ipmitool` and an optional switched PDU.

use super::PowerControl;
use crate::PowerState;
use crate::config::AcCommands;
use crate::config::PowerConfig;
use crate::run_host_cmd;
use anyhow::Context;
use std::process::Command;
use std::time::Duration;

/// Chassis power through the BMC; AC power through host commands.
pub struct IpmiPowerControl {
    host: String,
    user: String,
    password: String,
    interface: String,
    ac: Option<AcCommands>,
}

impl IpmiPowerControl {
    /// Build from configuration, reading the BMC password from the
    /// configured environment variable.
    pub fn from_config(config: &PowerConfig) -> anyhow::Result<Self> {
        let password = std::env::var(&config.password_env).with_context(|| {
            format!(
                "BMC password variable {} is not set",
                config.password_env
            )
        })?;
        Ok(Self {
            host: config.bmc_host.clone(),
            user: config.bmc_user.clone(),
            password,
            interface: config.interface.clone(),
            ac: config.ac.clone(),
        })
    }

    fn chassis_power(&self, action: &str) -> anyhow::Result<String> {
        let mut cmd = Command::new("ipmitool");
        cmd.args(["-I", &self.interface, "-H", &self.host, "-U", &self.user])
            // -E reads the password from IPMI_PASSWORD, keeping it out of argv.
            .arg("-E")
            .env("IPMI_PASSWORD", &self.password)
            .args(["chassis", "power", action]);
        run_host_cmd(cmd).with_context(|| format!("chassis power {action} failed"))
    }

    fn ac_command(&self, pick: fn(&AcCommands) -> &[String]) -> anyhow::Result<String> {
        let ac = self
            .ac
            .as_ref()
            .context("no AC power switch configured")?;
        let (program, args) = pick(ac)
            .split_first()
            .context("empty AC power command")?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(run_host_cmd(cmd)?)
    }
}

/// Parse `ipmitool chassis power status` output.
fn parse_chassis_status(output: &str) -> anyhow::Result<PowerState> {
    let status = output.trim().to_ascii_lowercase();
    if status.ends_with(" on") {
        Ok(PowerState::S0)
    } else if status.ends_with(" off") {
        Ok(PowerState::S5)
    } else {
        anyhow::bail!("unrecognized chassis status `{}`", output.trim())
    }
}

/// Whether PDU status output reports the outlet as powered.
fn parse_ac_status(output: &str) -> bool {
    output
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word.eq_ignore_ascii_case("on"))
}

impl PowerControl for IpmiPowerControl {
    fn dc_power_on(&mut self, _press: Duration) -> anyhow::Result<bool> {
        self.chassis_power("on")?;
        Ok(true)
    }

    fn dc_power_off(&mut self, _press: Duration) -> anyhow::Result<bool> {
        self.chassis_power("off")?;
        Ok(true)
    }

    fn dc_power_reset(&mut self) -> anyhow::Result<()> {
        self.chassis_power("reset")?;
        Ok(())
    }

    fn power_cycle(&mut self) -> anyhow::Result<()> {
        self.chassis_power("cycle")?;
        Ok(())
    }

    fn ac_power_on(&mut self, settle: Duration) -> anyhow::Result<bool> {
        self.ac_command(|ac| ac.on.as_slice())?;
        std::thread::sleep(settle);
        Ok(true)
    }

    fn ac_power_off(&mut self, settle: Duration) -> anyhow::Result<bool> {
        self.ac_command(|ac| ac.off.as_slice())?;
        std::thread::sleep(settle);
        Ok(true)
    }

    fn ac_power_state(&mut self) -> anyhow::Result<bool> {
        Ok(parse_ac_status(&self.ac_command(|ac| ac.status.as_slice())?))
    }

    fn power_state(&mut self) -> anyhow::Result<PowerState> {
        parse_chassis_status(&self.chassis_power("status")?)
    }
}
