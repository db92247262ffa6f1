// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory and processor inventory checks, comparing what the OS reports with
//! what the silicon debug probe reports.

use super::HealthCheck;
use super::HealthCheckKind;
use super::HealthContext;
use crate::OsFamily;
use crate::ResetKind;
use crate::config::CyclingConfig;
use crate::config::Named;
use crate::config::Selection;
use anyhow::Context;
use std::time::Duration;

/// BIOS scratchpad preserved across warm resets.
pub(crate) const STICKY_SCRATCHPAD: &str = "uncore.ubox.ncdecs.biosscratchpad6_cfg";
/// BIOS scratchpad cleared by any reset.
pub(crate) const NON_STICKY_SCRATCHPAD: &str = "uncore.ubox.ncdecs.biosnonstickyscratchpad7_cfg";
/// Marker written to both scratchpads before a reset.
pub(crate) const RESET_MARKER: u64 = 0xbf11_1111;

const OS_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// One memory/processor sub-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCheck {
    /// OS memory within tolerance of installed memory.
    SystemMemory,
    /// OS socket, core and thread counts equal the probe's.
    Cpu,
    /// One NUMA node per socket.
    NumaSnc,
    /// Enough free space on the root filesystem.
    DiskSpace,
    /// DIMMs run at the expected frequency.
    DdrFrequency,
    /// A warm reset preserved only the sticky scratchpad.
    ResetCheck,
}

impl Named for MemoryCheck {
    const WHAT: &'static str = "memory check";
    const ALL: &'static [Self] = &[
        Self::SystemMemory,
        Self::Cpu,
        Self::NumaSnc,
        Self::DiskSpace,
        Self::DdrFrequency,
        Self::ResetCheck,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::SystemMemory => "system_memory",
            Self::Cpu => "cpu",
            Self::NumaSnc => "numa_snc",
            Self::DiskSpace => "disk_space",
            Self::DdrFrequency => "ddr_freq",
            Self::ResetCheck => "reset_check",
        }
    }
}

/// Runs the configured memory sub-checks. Linux only.
pub struct MemoryHealthCheck {
    checks: Vec<MemoryCheck>,
    tolerance_percent: u32,
    min_free_disk_gb: u64,
    expected_ddr_frequency: Option<u32>,
}

impl MemoryHealthCheck {
    /// The sub-checks and limits in `config`.
    pub fn from_config(config: &CyclingConfig) -> Self {
        Self {
            checks: Selection::expand(&config.memory_checks),
            tolerance_percent: config.memory_tolerance_percent,
            min_free_disk_gb: config.min_free_disk_gb,
            expected_ddr_frequency: config.expected_ddr_frequency,
        }
    }

    fn run_one(&self, check: MemoryCheck, ctx: &mut HealthContext<'_>) -> anyhow::Result<String> {
        let os = &mut ctx.sut.os;
        match check {
            MemoryCheck::SystemMemory => {
                let meminfo = os.execute_stdout("cat /proc/meminfo", OS_QUERY_TIMEOUT)?;
                let os_mib = parse_meminfo_total_kib(&meminfo)? / 1024;
                let installed_mib = ctx.sut.silicon.inventory()?.memory_mib;
                if within_tolerance(os_mib, installed_mib, self.tolerance_percent) {
                    Ok(format!("OS {os_mib} MiB, installed {installed_mib} MiB"))
                } else {
                    anyhow::bail!(
                        "OS reports {os_mib} MiB but {installed_mib} MiB is installed (tolerance {}%)",
                        self.tolerance_percent
                    )
                }
            }
            MemoryCheck::Cpu => {
                let lscpu = LscpuSummary::parse(&os.execute_stdout("lscpu", OS_QUERY_TIMEOUT)?)?;
                let inventory = ctx.sut.silicon.inventory()?;
                let os_counts = (lscpu.sockets, lscpu.cores(), lscpu.threads());
                let silicon_counts = (inventory.sockets, inventory.cores, inventory.threads);
                if os_counts == silicon_counts {
                    Ok(format!("sockets/cores/threads {os_counts:?}"))
                } else {
                    anyhow::bail!(
                        "OS sockets/cores/threads {os_counts:?} differ from silicon {silicon_counts:?}"
                    )
                }
            }
            MemoryCheck::NumaSnc => {
                let lscpu = LscpuSummary::parse(&os.execute_stdout("lscpu", OS_QUERY_TIMEOUT)?)?;
                if lscpu.numa_nodes == lscpu.sockets {
                    Ok(format!("{} NUMA nodes", lscpu.numa_nodes))
                } else {
                    anyhow::bail!(
                        "{} NUMA nodes for {} sockets",
                        lscpu.numa_nodes,
                        lscpu.sockets
                    )
                }
            }
            MemoryCheck::DiskSpace => {
                let df = os.execute_stdout("df -BG --output=avail / | tail -n 1", OS_QUERY_TIMEOUT)?;
                let free = parse_free_gb(&df)?;
                if free >= self.min_free_disk_gb {
                    Ok(format!("{free} GB free"))
                } else {
                    anyhow::bail!("only {free} GB free, need {}", self.min_free_disk_gb)
                }
            }
            MemoryCheck::DdrFrequency => {
                let Some(expected) = self.expected_ddr_frequency else {
                    return Ok("no expected DDR frequency configured".into());
                };
                let dmidecode = os.execute_stdout("dmidecode -t memory", OS_QUERY_TIMEOUT)?;
                let speeds = parse_dimm_speeds(&dmidecode);
                if speeds.contains(&expected) {
                    Ok(format!("DIMM speeds {speeds:?} MT/s"))
                } else {
                    anyhow::bail!("expected {expected} MT/s, DIMMs report {speeds:?}")
                }
            }
            MemoryCheck::ResetCheck => {
                if ctx.kind != ResetKind::WarmReset {
                    return Ok(format!("not applicable to {}", ctx.kind));
                }
                let sockets = ctx.sut.silicon.socket_count()?;
                for socket in 0..sockets {
                    let sticky = ctx.sut.silicon.read_register(socket, STICKY_SCRATCHPAD)?;
                    let non_sticky = ctx
                        .sut
                        .silicon
                        .read_register(socket, NON_STICKY_SCRATCHPAD)?;
                    if sticky != RESET_MARKER || non_sticky == RESET_MARKER {
                        anyhow::bail!(
                            "socket {socket} after warm reset: sticky={sticky:#x} non-sticky={non_sticky:#x}, expected only sticky to hold {RESET_MARKER:#x}"
                        )
                    }
                }
                Ok(format!(
                    "only the sticky scratchpad held {RESET_MARKER:#x} on {sockets} socket(s)"
                ))
            }
        }
    }
}

impl HealthCheck for MemoryHealthCheck {
    fn kind(&self) -> HealthCheckKind {
        HealthCheckKind::Memory
    }

    fn check(&mut self, ctx: &mut HealthContext<'_>) -> anyhow::Result<bool> {
        if self.checks.is_empty() {
            return Ok(true);
        }
        if ctx.sut.os.os_family() != OsFamily::Linux {
            tracing::debug!("memory checks only run on Linux");
            return Ok(true);
        }

        let evidence = format!("memory_health_cycle{}.txt", ctx.cycle);
        let mut passed = true;
        for &check in &self.checks {
            let line = match self.run_one(check, ctx) {
                Ok(detail) => format!("{}: PASS ({detail})", check.name()),
                Err(e) => {
                    tracing::error!(
                        check = check.name(),
                        error = e.as_ref() as &dyn std::error::Error,
                        "memory check failed"
                    );
                    passed = false;
                    format!("{}: FAIL ({e:#})", check.name())
                }
            };
            ctx.append_evidence(&evidence, &line)?;
        }
        Ok(passed)
    }
}

fn within_tolerance(actual: u64, expected: u64, percent: u32) -> bool {
    actual.abs_diff(expected) * 100 <= expected * u64::from(percent)
}

fn parse_meminfo_total_kib(meminfo: &str) -> anyhow::Result<u64> {
    let line = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .context("no MemTotal in /proc/meminfo")?;
    let kib = line.trim().trim_end_matches("kB").trim();
    kib.parse()
        .with_context(|| format!("bad MemTotal value `{kib}`"))
}

fn parse_free_gb(df: &str) -> anyhow::Result<u64> {
    let value = df.trim().trim_end_matches('G');
    value
        .parse()
        .with_context(|| format!("bad df output `{}`", df.trim()))
}

/// Configured or rated speeds of populated DIMMs, in MT/s.
fn parse_dimm_speeds(dmidecode: &str) -> Vec<u32> {
    let mut speeds: Vec<u32> = dmidecode
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once(':')?;
            if key != "Speed" && key != "Configured Memory Speed" {
                return None;
            }
            value.split_whitespace().next()?.parse().ok()
        })
        .collect();
    speeds.sort_unstable();
    speeds.dedup();
    speeds
}

/// The `lscpu` fields the checks need.
#[derive(Debug, PartialEq, Eq)]
struct LscpuSummary {
    sockets: u32,
    cores_per_socket: u32,
    threads_per_core: u32,
    numa_nodes: u32,
}

impl LscpuSummary {
    fn parse(lscpu: &str) -> anyhow::Result<Self> {
        let field = |name: &str| -> anyhow::Result<u32> {
            let value = lscpu
                .lines()
                .find_map(|line| {
                    let (key, value) = line.split_once(':')?;
                    (key.trim() == name).then_some(value.trim())
                })
                .with_context(|| format!("lscpu has no `{name}`"))?;
            value
                .parse()
                .with_context(|| format!("bad lscpu `{name}` value `{value}`"))
        };
        Ok(Self {
            sockets: field("Socket(s)")?,
            cores_per_socket: field("Core(s) per socket")?,
            threads_per_core: field("Thread(s) per core")?,
            numa_nodes: field("NUMA node(s)")?,
        })
    }

    fn cores(&self) -> u32 {
        self.sockets * self.cores_per_socket
    }

    fn threads(&self) -> u32 {
        self.cores() * self.threads_per_core
    }
}
