// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::HealthCheck;
use super::HealthCheckKind;
use super::HealthContext;
use crate::config::UpiExpectations;
use crate::sut::DebugReport;
use std::time::Duration;

/// How long link mismatches are re-polled before the check fails.
const LINK_SETTLE_TIMEOUT: Duration = Duration::from_secs(20);
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Verifies the UPI topology and the speed and power state of every link.
pub struct UpiCheck {
    topology: Option<String>,
    expected: Vec<(&'static str, String)>,
}

impl UpiCheck {
    /// Expect the topology and link speed in `upi`.
    pub fn new(upi: &UpiExpectations) -> Self {
        Self {
            topology: upi.topology.clone(),
            expected: vec![
                ("Link Speed", upi.link_speed.clone()),
                ("Setting", "Fast Mode".into()),
                ("Status", "Fast Mode".into()),
                ("Tx State", "L0".into()),
                ("Rx State", "L0".into()),
            ],
        }
    }

    /// Mismatches between `report` and the expected link table, one message
    /// per offending field.
    fn link_errors(&self, report: &str) -> Vec<String> {
        let mut errors = Vec::new();
        for line in report
            .lines()
            .filter(|line| line.contains("Link Speed:") && !line.contains("Port 3,"))
        {
            let (port, fields) = parse_link_line(line);
            for (key, want) in &self.expected {
                let got = fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
                match got {
                    Some(got) if got == want => {}
                    // Link power management may park idle links in L0p/L1.
                    Some(got)
                        if key.ends_with("State")
                            && (got.starts_with("L0") || got.starts_with("L1")) => {}
                    Some(got) => errors.push(format!("{port}: {key} is {got}, expected {want}")),
                    None => errors.push(format!("{port}: {key} missing")),
                }
            }
        }
        errors
    }
}

/// Topology name from a report line such as `4S4L Topology`.
fn parse_topology(report: &str) -> Option<&str> {
    report
        .lines()
        .find_map(|line| line.split_once(" Topology"))
        .map(|(name, _)| name.trim())
        .filter(|name| !name.is_empty())
}

/// Split `S0, Port 1, Link Speed: 16.0 GT/s | Tx State: L0 ...` into the
/// port prefix and its `key: value` fields.
fn parse_link_line(line: &str) -> (String, Vec<(String, String)>) {
    let mut parts = line.splitn(3, ',');
    let socket = parts.next().unwrap_or_default().trim();
    let port = parts.next().unwrap_or_default().trim();
    let rest = parts.next().unwrap_or_default();
    let fields = rest
        .split([',', '|'])
        .filter_map(|field| field.split_once(':'))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .collect();
    (format!("{socket} {port}"), fields)
}

impl HealthCheck for UpiCheck {
    fn kind(&self) -> HealthCheckKind {
        HealthCheckKind::Upi
    }

    fn check(&mut self, ctx: &mut HealthContext<'_>) -> anyhow::Result<bool> {
        let evidence = format!("upi_cycle{}.log", ctx.cycle);
        let mut passed = true;

        if let Some(expected) = &self.topology {
            let report = ctx.sut.silicon.capture(DebugReport::UpiTopology)?;
            ctx.append_evidence(&evidence, &report)?;
            match parse_topology(&report) {
                Some(found) if found.eq_ignore_ascii_case(expected) => {
                    tracing::info!(topology = found, "UPI topology matches");
                }
                found => {
                    tracing::error!(?found, expected, "UPI topology mismatch");
                    passed = false;
                }
            }
        }

        let start = ctx.clock.now();
        loop {
            let report = ctx.sut.silicon.capture(DebugReport::UpiLinkSpeed)?;
            let errors = self.link_errors(&report);
            if errors.is_empty() {
                ctx.append_evidence(&evidence, &report)?;
                break;
            }
            if ctx.clock.now().saturating_sub(start) >= LINK_SETTLE_TIMEOUT {
                ctx.append_evidence(&evidence, &report)?;
                for error in &errors {
                    tracing::error!(error, "UPI link mismatch");
                }
                passed = false;
                break;
            }
            tracing::debug!(mismatches = errors.len(), "UPI links not settled, polling");
            ctx.clock.sleep(LINK_POLL_INTERVAL);
        }

        Ok(passed)
    }
}
