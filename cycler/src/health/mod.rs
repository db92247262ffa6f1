// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Post-cycle hardware health checks.
//!
//! Each check is an independent predicate behind [`HealthCheck`]. The
//! [`HealthChecks`] aggregator runs every enabled check without
//! short-circuiting, so one cycle reports all failing subsystems at once.

mod clock_source;
mod memory;
mod pcie;
mod registers;
mod upi;

pub use clock_source::ClockSourceCheck;
pub use memory::MemoryCheck;
pub use memory::MemoryHealthCheck;
pub use pcie::PcieCheck;
pub use registers::CpuThermalCheck;
pub use registers::DimmThermalCheck;
pub use registers::DmiCheck;
pub use registers::McStatusCheck;
pub use registers::dmi_status;
pub use upi::UpiCheck;

pub(crate) use memory::NON_STICKY_SCRATCHPAD;
pub(crate) use memory::RESET_MARKER;
pub(crate) use memory::STICKY_SCRATCHPAD;

use crate::ResetKind;
use crate::clock::Clock;
use crate::config::CyclingConfig;
use crate::config::Named;
use crate::config::Selection;
use crate::sut::Sut;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;

/// The health checks the aggregator knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthCheckKind {
    /// PCIe link status compared to a baseline.
    Pcie,
    /// DMI error status registers.
    Dmi,
    /// UPI topology and link state.
    Upi,
    /// Machine-check status registers.
    Mce,
    /// DIMM thermal status.
    DimmThermal,
    /// CPU package thermal status.
    CpuThermal,
    /// OS and silicon memory/CPU inventory agreement.
    Memory,
    /// OS clocksource.
    Clock,
}

impl HealthCheckKind {
    /// Checks enabled when the configuration does not name any.
    pub const DEFAULT: [HealthCheckKind; 7] = [
        Self::Pcie,
        Self::Dmi,
        Self::Upi,
        Self::Mce,
        Self::DimmThermal,
        Self::CpuThermal,
        Self::Memory,
    ];

    /// Thermal checks only run periodically.
    pub fn is_thermal(&self) -> bool {
        matches!(self, Self::DimmThermal | Self::CpuThermal)
    }

    /// Ledger label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pcie => "PCIE",
            Self::Dmi => "DMI",
            Self::Upi => "UPI",
            Self::Mce => "MCE",
            Self::DimmThermal => "DIMM_THERMAL",
            Self::CpuThermal => "CPU_THERMAL",
            Self::Memory => "MEMORY_CHECK",
            Self::Clock => "CLOCK",
        }
    }
}

impl Named for HealthCheckKind {
    const WHAT: &'static str = "health check";
    const ALL: &'static [Self] = &[
        Self::Pcie,
        Self::Dmi,
        Self::Upi,
        Self::Mce,
        Self::DimmThermal,
        Self::CpuThermal,
        Self::Memory,
        Self::Clock,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::Pcie => "pcie",
            Self::Dmi => "dmi",
            Self::Upi => "upi",
            Self::Mce => "mce",
            Self::DimmThermal => "dimm_thermal",
            Self::CpuThermal => "cpu_thermal",
            Self::Memory => "memory_check",
            Self::Clock => "clock",
        }
    }
}

impl fmt::Display for HealthCheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// What a health check may touch while it runs.
pub struct HealthContext<'a> {
    /// The SUT.
    pub sut: &'a mut Sut,
    /// Time source for polling checks.
    pub clock: &'a dyn Clock,
    /// Directory receiving evidence files.
    pub dir: &'a Path,
    /// The cycle being checked; 0 while capturing baselines.
    pub cycle: u32,
    /// The transition the cycle performed.
    pub kind: ResetKind,
}

impl HealthContext<'_> {
    /// Append `text` to the evidence file `name`.
    pub fn append_evidence(&self, name: &str, text: &str) -> anyhow::Result<()> {
        fs_err::create_dir_all(self.dir)?;
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(name))?;
        writeln!(file, "{}", text.trim_end())?;
        Ok(())
    }
}

/// One health predicate.
pub trait HealthCheck {
    /// Which check this is.
    fn kind(&self) -> HealthCheckKind;

    /// Capture whatever baseline later cycles compare against.
    fn prepare(&mut self, _ctx: &mut HealthContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run the check. Errors count as failure.
    fn check(&mut self, ctx: &mut HealthContext<'_>) -> anyhow::Result<bool>;
}

/// Pass/fail per check that ran, ordered by [`HealthCheckKind`] regardless
/// of the order the checks ran in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckResult {
    outcomes: BTreeMap<HealthCheckKind, bool>,
}

impl HealthCheckResult {
    /// Record one outcome.
    pub fn insert(&mut self, kind: HealthCheckKind, passed: bool) {
        self.outcomes.insert(kind, passed);
    }

    /// Whether every check that ran passed.
    pub fn passed(&self) -> bool {
        self.outcomes.values().all(|passed| *passed)
    }

    /// Checks that failed.
    pub fn failures(&self) -> Vec<HealthCheckKind> {
        self.outcomes
            .iter()
            .filter(|(_, passed)| !**passed)
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// The outcome of `kind`, or `None` if it did not run.
    pub fn outcome(&self, kind: HealthCheckKind) -> Option<bool> {
        self.outcomes.get(&kind).copied()
    }
}

/// Runs the enabled health checks after each successful cycle.
pub struct HealthChecks {
    checks: Vec<Box<dyn HealthCheck>>,
    thermal_interval: u32,
}

impl HealthChecks {
    /// An empty aggregator.
    pub fn new(thermal_interval: u32) -> Self {
        Self {
            checks: Vec::new(),
            thermal_interval: thermal_interval.max(1),
        }
    }

    /// Add a check.
    pub fn with_check(mut self, check: Box<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// The checks named in `config`.
    pub fn from_config(config: &CyclingConfig) -> Self {
        let mut checks = Self::new(config.thermal_check_interval);
        for kind in Selection::expand(&config.health_checks) {
            let check: Box<dyn HealthCheck> = match kind {
                HealthCheckKind::Pcie => Box::new(PcieCheck::new()),
                HealthCheckKind::Dmi => Box::new(DmiCheck),
                HealthCheckKind::Upi => Box::new(UpiCheck::new(&config.upi)),
                HealthCheckKind::Mce => Box::new(McStatusCheck),
                HealthCheckKind::DimmThermal => Box::new(DimmThermalCheck),
                HealthCheckKind::CpuThermal => Box::new(CpuThermalCheck),
                HealthCheckKind::Memory => Box::new(MemoryHealthCheck::from_config(config)),
                HealthCheckKind::Clock => Box::new(ClockSourceCheck),
            };
            checks = checks.with_check(check);
        }
        checks
    }

    /// The enabled checks.
    pub fn kinds(&self) -> Vec<HealthCheckKind> {
        self.checks.iter().map(|c| c.kind()).collect()
    }

    /// Whether `kind` runs on `cycle`. Thermal checks run on cycle 1 and on
    /// every multiple of the thermal interval.
    pub fn runs_on_cycle(&self, kind: HealthCheckKind, cycle: u32) -> bool {
        due_on_cycle(kind, cycle, self.thermal_interval)
    }

    /// Capture baselines. A failed baseline is logged; the check then
    /// decides for itself how to behave.
    pub fn prepare(&mut self, ctx: &mut HealthContext<'_>) {
        for check in &mut self.checks {
            if let Err(e) = check.prepare(ctx) {
                tracing::error!(
                    check = %check.kind(),
                    error = e.as_ref() as &dyn std::error::Error,
                    "failed to capture health check baseline"
                );
            }
        }
    }

    /// Run every check due on `ctx.cycle`.
    pub fn run(&mut self, ctx: &mut HealthContext<'_>) -> HealthCheckResult {
        let mut result = HealthCheckResult::default();
        let cycle = ctx.cycle;
        let thermal_interval = self.thermal_interval;
        for check in &mut self.checks {
            let kind = check.kind();
            if !due_on_cycle(kind, cycle, thermal_interval) {
                tracing::debug!(check = %kind, cycle, "thermal check not due");
                continue;
            }
            let passed = match check.check(ctx) {
                Ok(passed) => passed,
                Err(e) => {
                    tracing::error!(
                        check = %kind,
                        error = e.as_ref() as &dyn std::error::Error,
                        "health check errored"
                    );
                    false
                }
            };
            if passed {
                tracing::info!(check = %kind, cycle, "health check passed");
            } else {
                tracing::error!(check = %kind, cycle, "health check failed");
            }
            result.insert(kind, passed);
        }
        result
    }
}

fn due_on_cycle(kind: HealthCheckKind, cycle: u32, thermal_interval: u32) -> bool {
    !kind.is_thermal() || cycle == 1 || cycle % thermal_interval == 0
}
