// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Checks that read silicon status registers through the debug probe.

use super::HealthCheck;
use super::HealthCheckKind;
use super::HealthContext;

const MC_STATUS: &str = "uncore.punit.mc_status";
const DMI_ERROR_STATUS: [&str; 2] = ["uncore.dmi.uncerrsts", "uncore.dmi.corerrsts"];
const DIMM_THERMAL_STATUS: [&str; 2] = [
    "uncore.memss.mcs.chs.dimmtempstat_0",
    "uncore.memss.mcs.chs.memhot_status",
];
const CPU_THERMAL_STATUS: [&str; 1] = ["uncore.punit.package_therm_status"];

/// Read `paths` on every socket, logging `path=value` lines to `evidence`.
/// Returns the registers that read non-zero.
fn read_all_sockets(
    ctx: &mut HealthContext<'_>,
    paths: &[&str],
    evidence: &str,
) -> anyhow::Result<Vec<(u32, String, u64)>> {
    let sockets = ctx.sut.silicon.socket_count()?;
    let mut lines = Vec::new();
    let mut nonzero = Vec::new();
    for socket in 0..sockets {
        for path in paths {
            let value = ctx.sut.silicon.read_register(socket, path)?;
            lines.push(format!("socket{socket}.{path}={value:#010x}"));
            if value != 0 {
                nonzero.push((socket, (*path).to_owned(), value));
            }
        }
    }
    ctx.append_evidence(evidence, &lines.join("\n"))?;
    Ok(nonzero)
}

/// Per-socket machine-check status must be clear.
pub struct McStatusCheck;

impl HealthCheck for McStatusCheck {
    fn kind(&self) -> HealthCheckKind {
        HealthCheckKind::Mce
    }

    fn check(&mut self, ctx: &mut HealthContext<'_>) -> anyhow::Result<bool> {
        let evidence = format!("mc_status_cycle{}.txt", ctx.cycle);
        let errors = read_all_sockets(ctx, &[MC_STATUS], &evidence)?;
        for (socket, path, value) in &errors {
            tracing::error!(socket, path, value = format_args!("{value:#x}"), "machine check logged");
        }
        Ok(errors.is_empty())
    }
}

/// Read the DMI error status registers on the legacy socket, returning
/// whether they are clear. Also used as a diagnostic after boot failures.
pub fn dmi_status(ctx: &mut HealthContext<'_>) -> anyhow::Result<bool> {
    let mut lines = Vec::new();
    let mut clear = true;
    for path in DMI_ERROR_STATUS {
        let value = ctx.sut.silicon.read_register(0, path)?;
        lines.push(format!("{path}={value:#010x}"));
        if value != 0 {
            tracing::error!(path, value = format_args!("{value:#x}"), "DMI error status set");
            clear = false;
        }
    }
    ctx.append_evidence(&format!("dmi_status_cycle{}.txt", ctx.cycle), &lines.join("\n"))?;
    Ok(clear)
}

/// DMI error status must be clear.
pub struct DmiCheck;

impl HealthCheck for DmiCheck {
    fn kind(&self) -> HealthCheckKind {
        HealthCheckKind::Dmi
    }

    fn check(&mut self, ctx: &mut HealthContext<'_>) -> anyhow::Result<bool> {
        dmi_status(ctx)
    }
}

/// Records DIMM temperature and MEMHOT status; fails only if the registers
/// cannot be read.
pub struct DimmThermalCheck;

impl HealthCheck for DimmThermalCheck {
    fn kind(&self) -> HealthCheckKind {
        HealthCheckKind::DimmThermal
    }

    fn check(&mut self, ctx: &mut HealthContext<'_>) -> anyhow::Result<bool> {
        let evidence = format!("dimm_thermal_cycle{}.txt", ctx.cycle);
        read_all_sockets(ctx, &DIMM_THERMAL_STATUS, &evidence)?;
        Ok(true)
    }
}

/// Records package thermal status; fails only if the registers cannot be
/// read.
pub struct CpuThermalCheck;

impl HealthCheck for CpuThermalCheck {
    fn kind(&self) -> HealthCheckKind {
        HealthCheckKind::CpuThermal
    }

    fn check(&mut self, ctx: &mut HealthContext<'_>) -> anyhow::Result<bool> {
        let evidence = format!("cpu_thermal_cycle{}.txt", ctx.cycle);
        read_all_sockets(ctx, &CPU_THERMAL_STATUS, &evidence)?;
        Ok(true)
    }
}
