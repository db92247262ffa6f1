// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::HealthCheck;
use super::HealthCheckKind;
use super::HealthContext;
use crate::OsFamily;
use crate::sut::DebugReport;
use std::time::Duration;

/// Device headers and negotiated link status of every PCIe function.
const LSPCI_LINK_STATUS: &str = r#"lspci -vv | grep -e "LnkSta:" -e "^[[:xdigit:]]""#;
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(120);

/// Compares PCIe link status after every cycle with a snapshot taken before
/// the first one. Only Linux is checked; Windows and other OSes pass.
pub struct PcieCheck {
    baseline: Option<String>,
    enabled: bool,
}

impl PcieCheck {
    /// A check with no baseline yet.
    pub fn new() -> Self {
        Self {
            baseline: None,
            enabled: true,
        }
    }
}

fn snapshot(ctx: &mut HealthContext<'_>) -> anyhow::Result<String> {
    ctx.sut.os.execute_stdout(LSPCI_LINK_STATUS, SNAPSHOT_TIMEOUT)
}

/// Lines present in only one of the two snapshots, prefixed `-` or `+`.
fn link_differences(baseline: &str, current: &str) -> Vec<String> {
    let before: Vec<&str> = baseline.lines().collect();
    let after: Vec<&str> = current.lines().collect();
    let mut diff: Vec<String> = before
        .iter()
        .filter(|line| !after.contains(line))
        .map(|line| format!("- {line}"))
        .collect();
    diff.extend(
        after
            .iter()
            .filter(|line| !before.contains(line))
            .map(|line| format!("+ {line}")),
    );
    diff
}

impl HealthCheck for PcieCheck {
    fn kind(&self) -> HealthCheckKind {
        HealthCheckKind::Pcie
    }

    fn prepare(&mut self, ctx: &mut HealthContext<'_>) -> anyhow::Result<()> {
        match ctx.sut.os.os_family() {
            OsFamily::Linux => {}
            OsFamily::Windows => {
                // lspci-equivalent enumeration has crashed Windows SUTs.
                tracing::warn!("PCIe health check is not run on Windows");
                self.enabled = false;
                return Ok(());
            }
            OsFamily::Other => {
                self.enabled = false;
                return Ok(());
            }
        }

        match snapshot(ctx) {
            Ok(text) => {
                ctx.append_evidence("PciInitialSnapshot.log", &text)?;
                tracing::info!(lines = text.lines().count(), "PCIe baseline captured");
                self.baseline = Some(text);
                Ok(())
            }
            Err(e) => {
                self.enabled = false;
                Err(e.context("failed to capture PCIe baseline; PCIe check disabled"))
            }
        }
    }

    fn check(&mut self, ctx: &mut HealthContext<'_>) -> anyhow::Result<bool> {
        if !self.enabled {
            return Ok(true);
        }
        let Some(baseline) = &self.baseline else {
            tracing::warn!("no PCIe baseline, skipping");
            return Ok(true);
        };
        if !ctx.sut.os.is_alive() {
            tracing::error!("OS is not alive, cannot snapshot PCIe");
            return Ok(false);
        }

        let current = snapshot(ctx)?;
        ctx.append_evidence(&format!("PciSnapshot_Cycle{}.log", ctx.cycle), &current)?;
        if current == *baseline {
            return Ok(true);
        }

        let diff = link_differences(baseline, &current);
        tracing::error!(
            cycle = ctx.cycle,
            differences = diff.len(),
            "PCIe link status differs from baseline:\n{}",
            diff.join("\n")
        );
        match ctx.sut.silicon.capture(DebugReport::PcieErrors) {
            Ok(report) => {
                ctx.append_evidence(&format!("PcieErrors_Cycle{}.log", ctx.cycle), &report)?
            }
            Err(e) => tracing::warn!(
                error = e.as_ref() as &dyn std::error::Error,
                "failed to capture PCIe error status"
            ),
        }
        Ok(false)
    }
}
