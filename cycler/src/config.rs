// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! JSON configuration for a cycling deployment.
//!
//! Every field in [`CyclingConfig`] has a default so a minimal file only
//! needs to describe how to reach the SUT and its BMC:
//!
//! ```json
//! {
//!     "sut": { "host": "10.0.0.20", "os": "linux" },
//!     "power": { "bmc_host": "10.0.0.21", "bmc_user": "admin" },
//!     "cycling": { "cycles": 100, "stop_on_failure": ["pc_stuck"] }
//! }
//! ```

use crate::FailureClass;
use crate::OsFamily;
use crate::PostCode;
use crate::ResetKind;
use crate::diagnostics::DumpDomain;
use crate::health::HealthCheckKind;
use crate::health::MemoryCheck;
use serde::Deserialize;
use serde::Deserializer;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default number of cycles in a campaign.
pub const DEFAULT_ITERATIONS: u32 = 25;
/// Post-code stuck timeout used when the configured value is zero.
pub const DEFAULT_POST_CODE_STUCK_TIMEOUT: Duration = Duration::from_secs(900);

/// Error loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration")]
    Read(#[from] std::io::Error),
    /// The file is not valid JSON for this schema.
    #[error("failed to parse configuration")]
    Parse(#[from] serde_json::Error),
    /// A name in a list is not recognized.
    #[error("unknown {what} `{name}`")]
    UnknownName {
        /// What kind of name was expected.
        what: &'static str,
        /// The name as written.
        name: String,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A closed set of items selectable by name from configuration.
pub trait Named: Copy + PartialEq + 'static {
    /// What the items are called, for error messages.
    const WHAT: &'static str;
    /// Every item in canonical order.
    const ALL: &'static [Self];
    /// The configuration name of this item.
    fn name(&self) -> &'static str;
}

/// Either one named item or the keyword `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection<T> {
    /// Every item.
    All,
    /// A single item.
    One(T),
}

impl<T: Named> Selection<T> {
    /// Expand a list of selections into the selected items, in canonical
    /// order and without duplicates.
    pub fn expand(selections: &[Self]) -> Vec<T> {
        T::ALL
            .iter()
            .copied()
            .filter(|item| {
                selections.iter().any(|s| match s {
                    Selection::All => true,
                    Selection::One(one) => one == item,
                })
            })
            .collect()
    }
}

impl<T: Named> FromStr for Selection<T> {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        if wanted == "all" {
            return Ok(Selection::All);
        }
        T::ALL
            .iter()
            .find(|item| item.name() == wanted)
            .map(|item| Selection::One(*item))
            .ok_or_else(|| ConfigError::UnknownName {
                what: T::WHAT,
                name: s.to_owned(),
            })
    }
}

impl<'de, T: Named> Deserialize<'de> for Selection<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl<T: Named> fmt::Display for Selection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::All => f.pad("all"),
            Selection::One(item) => f.pad(item.name()),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CyclerConfig {
    /// How to reach the SUT operating system.
    pub sut: SutConfig,
    /// How to control platform power.
    pub power: PowerConfig,
    /// Host command that prints the current post code.
    #[serde(default)]
    pub post_code: Option<ProbeCommand>,
    /// Host command that fronts the silicon debug probe.
    #[serde(default)]
    pub silicon_debug: Option<ProbeCommand>,
    /// Cycling behavior.
    #[serde(default)]
    pub cycling: CyclingConfig,
}

impl CyclerConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs_err::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sut.host.trim().is_empty() {
            return Err(ConfigError::Invalid("sut.host is empty".into()));
        }
        if self.power.bmc_host.trim().is_empty() {
            return Err(ConfigError::Invalid("power.bmc_host is empty".into()));
        }
        for (name, probe) in [
            ("post_code", &self.post_code),
            ("silicon_debug", &self.silicon_debug),
        ] {
            if probe.as_ref().is_some_and(|p| p.command.is_empty()) {
                return Err(ConfigError::Invalid(format!("{name}.command is empty")));
            }
        }
        self.cycling.validate()
    }
}

/// SSH access to the SUT.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SutConfig {
    /// Host name or address.
    pub host: String,
    /// Login user.
    #[serde(default = "default_user")]
    pub user: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key to authenticate with.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// OS family installed on the SUT.
    pub os: OsFamily,
    /// Seconds to wait for the SSH connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Seconds to wait for a command to complete.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_user() -> String {
    "root".into()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    120
}

/// BMC and AC power access.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerConfig {
    /// BMC host name or address.
    pub bmc_host: String,
    /// BMC user.
    pub bmc_user: String,
    /// Environment variable holding the BMC password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// `ipmitool` interface.
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Host commands for a switched PDU, if the rig has one.
    #[serde(default)]
    pub ac: Option<AcCommands>,
}

fn default_password_env() -> String {
    "CYCLER_BMC_PASSWORD".into()
}

fn default_interface() -> String {
    "lanplus".into()
}

/// Host commands that switch and query AC power. Each is a program followed
/// by its arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcCommands {
    /// Turns AC power on.
    pub on: Vec<String>,
    /// Turns AC power off.
    pub off: Vec<String>,
    /// Prints the AC state; output containing `on` means powered.
    pub status: Vec<String>,
}

/// A host program and leading arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeCommand {
    /// Program followed by its leading arguments.
    pub command: Vec<String>,
}

/// Platform vendor quirks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// No quirks.
    #[default]
    Generic,
    /// Dell BMCs need several minutes after AC restore before they accept
    /// power commands.
    Dell,
}

impl Platform {
    /// Delay to wait after AC power is restored.
    pub fn ac_restore_settle(&self) -> Duration {
        match self {
            Platform::Generic => Duration::ZERO,
            Platform::Dell => Duration::from_secs(300),
        }
    }
}

/// Wait bounds, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Maximum time for the OS to come back after a transition.
    pub reboot_secs: u64,
    /// How long a post code may stay unchanged before it counts as stuck.
    /// Zero selects [`DEFAULT_POST_CODE_STUCK_TIMEOUT`].
    pub post_code_stuck_secs: u64,
    /// Maximum time for the SUT to leave S0 after a sleep command.
    pub state_change_secs: u64,
    /// Interval between OS liveness probes while waiting for boot.
    pub os_poll_secs: u64,
    /// Interval between post code reads while waiting for boot.
    pub post_code_poll_secs: u64,
    /// Extra time after boot for services to settle.
    pub boot_settle_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            reboot_secs: 600,
            post_code_stuck_secs: 0,
            state_change_secs: 600,
            os_poll_secs: 10,
            post_code_poll_secs: 5,
            boot_settle_secs: 0,
        }
    }
}

impl Timeouts {
    /// Maximum time for the OS to come back.
    pub fn reboot(&self) -> Duration {
        Duration::from_secs(self.reboot_secs)
    }

    /// Time an unchanged post code may persist.
    pub fn post_code_stuck(&self) -> Duration {
        if self.post_code_stuck_secs == 0 {
            DEFAULT_POST_CODE_STUCK_TIMEOUT
        } else {
            Duration::from_secs(self.post_code_stuck_secs)
        }
    }

    /// Maximum time to leave S0.
    pub fn state_change(&self) -> Duration {
        Duration::from_secs(self.state_change_secs)
    }

    /// OS liveness poll interval.
    pub fn os_poll(&self) -> Duration {
        Duration::from_secs(self.os_poll_secs)
    }

    /// Post code poll interval.
    pub fn post_code_poll(&self) -> Duration {
        Duration::from_secs(self.post_code_poll_secs)
    }

    /// Settle time after boot.
    pub fn boot_settle(&self) -> Duration {
        Duration::from_secs(self.boot_settle_secs)
    }
}

/// Expected UPI fabric state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpiExpectations {
    /// Expected topology name (for example `4S4L`); unchecked if absent.
    pub topology: Option<String>,
    /// Expected link speed.
    pub link_speed: String,
}

impl Default for UpiExpectations {
    fn default() -> Self {
        Self {
            topology: None,
            link_speed: "16.0 GT/s".into(),
        }
    }
}

/// How a campaign cycles and what it checks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CyclingConfig {
    /// Number of cycles to run.
    pub cycles: u32,
    /// Transition to perform each cycle.
    pub kind: Option<ResetKind>,
    /// Wait bounds.
    pub timeouts: Timeouts,
    /// Platform vendor quirks.
    pub platform: Platform,
    /// Run health checks after every successful cycle.
    pub health_check: bool,
    /// Health checks to run.
    pub health_checks: Vec<Selection<HealthCheckKind>>,
    /// Thermal checks run on cycle 1 and every this many cycles.
    pub thermal_check_interval: u32,
    /// Memory sub-checks to run as part of the memory health check.
    pub memory_checks: Vec<Selection<MemoryCheck>>,
    /// Skip the OS machine-check log inspection.
    pub ignore_mce_errors: bool,
    /// Arm break-on-machine-check through the silicon probe after graceful
    /// power-on.
    pub machine_check_break: bool,
    /// Turn power-state mismatches into hard test failures.
    pub fail_on_state_mismatch: bool,
    /// Failure classes that stop the campaign.
    pub stop_on_failure: Vec<FailureClass>,
    /// Post codes shown by the BIOS once the OS has taken over.
    pub os_post_codes: Vec<PostCode>,
    /// Post codes for which analyzer logs are never collected.
    pub ignore_post_codes: Vec<PostCode>,
    /// Silicon dumps to capture on health-check failure.
    pub dump_domains: Vec<Selection<DumpDomain>>,
    /// Trace analyzers to run on a stuck post code.
    pub analyzers: Vec<String>,
    /// Expected UPI fabric state.
    pub upi: UpiExpectations,
    /// Expected DDR frequency in MT/s.
    pub expected_ddr_frequency: Option<u32>,
    /// Minimum free space on the root filesystem, in GB.
    pub min_free_disk_gb: u64,
    /// Allowed difference between OS and installed memory, in percent.
    pub memory_tolerance_percent: u32,
}

impl Default for CyclingConfig {
    fn default() -> Self {
        Self {
            cycles: DEFAULT_ITERATIONS,
            kind: None,
            timeouts: Timeouts::default(),
            platform: Platform::Generic,
            health_check: true,
            health_checks: HealthCheckKind::DEFAULT
                .iter()
                .map(|kind| Selection::One(*kind))
                .collect(),
            thermal_check_interval: 10,
            memory_checks: Vec::new(),
            ignore_mce_errors: false,
            machine_check_break: false,
            fail_on_state_mismatch: false,
            stop_on_failure: Vec::new(),
            os_post_codes: Vec::new(),
            ignore_post_codes: Vec::new(),
            dump_domains: Vec::new(),
            analyzers: Vec::new(),
            upi: UpiExpectations::default(),
            expected_ddr_frequency: None,
            min_free_disk_gb: 5,
            memory_tolerance_percent: 10,
        }
    }
}

impl CyclingConfig {
    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thermal_check_interval == 0 {
            return Err(ConfigError::Invalid(
                "thermal_check_interval must be at least 1".into(),
            ));
        }
        if self.analyzers.iter().any(|a| a.trim().is_empty()) {
            return Err(ConfigError::Invalid("empty analyzer name".into()));
        }
        Ok(())
    }

    /// Whether `class` (or `any`) is in the stop-on-failure list.
    pub fn stops_on(&self, class: FailureClass) -> bool {
        self.stop_on_failure
            .iter()
            .any(|c| *c == class || *c == FailureClass::Any)
    }

    /// Analyzer names, trimmed and lower-cased.
    pub fn analyzer_names(&self) -> Vec<String> {
        self.analyzers
            .iter()
            .map(|a| a.trim().to_ascii_lowercase())
            .collect()
    }
}
