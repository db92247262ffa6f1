// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::HealthCheck;
use super::HealthCheckKind;
use super::HealthContext;
use crate::OsFamily;
use std::time::Duration;

const CURRENT_CLOCKSOURCE: &str =
    "cat /sys/devices/system/clocksource/clocksource0/current_clocksource";

/// The kernel must still be using the TSC after the cycle. A fallback to
/// HPET or ACPI PM means the TSC was marked unstable.
pub struct ClockSourceCheck;

impl HealthCheck for ClockSourceCheck {
    fn kind(&self) -> HealthCheckKind {
        HealthCheckKind::Clock
    }

    fn check(&mut self, ctx: &mut HealthContext<'_>) -> anyhow::Result<bool> {
        if ctx.sut.os.os_family() != OsFamily::Linux {
            return Ok(true);
        }
        let source = ctx
            .sut
            .os
            .execute_stdout(CURRENT_CLOCKSOURCE, Duration::from_secs(30))?;
        ctx.append_evidence(
            &format!("clock_source_cycle{}.txt", ctx.cycle),
            &format!("clocksource={source}"),
        )?;
        if source.contains("tsc") {
            Ok(true)
        } else {
            tracing::error!(source, "clocksource is not tsc");
            Ok(false)
        }
    }
}
