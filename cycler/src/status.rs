// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Closed vocabularies shared by the engine, the handlers and the ledger.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Outcome of one reset/power-cycle attempt.
///
/// Only `Success` leads to health checks; every other value is an expected
/// hardware failure mode that the dispatch table routes to a failure handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResetStatus {
    /// The SUT reached the requested state and booted back to the OS.
    Success,
    /// The BIOS post code stopped advancing.
    PcStuck,
    /// The DC power command failed.
    DcFailure,
    /// The AC power command failed.
    AcFailure,
    /// The power controller never reported the expected state.
    StateChangeFailure,
    /// The OS did not come back and no post code was available.
    OsNotAlive,
}

impl ResetStatus {
    /// Returns true for [`ResetStatus::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ResetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Success => "SUCCESS",
            Self::PcStuck => "PC_STUCK",
            Self::DcFailure => "DC_FAILURE",
            Self::AcFailure => "AC_FAILURE",
            Self::StateChangeFailure => "STATE_CHANGE_FAILURE",
            Self::OsNotAlive => "OS_NOT_ALIVE",
        })
    }
}

/// Direction of the boot flow when a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootFlow {
    /// The SUT was powering on.
    PowerOn,
    /// The SUT was powering off or entering a sleep state.
    PowerOff,
}

impl fmt::Display for BootFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::PowerOn => "PowerOn",
            Self::PowerOff => "PowerOff",
        })
    }
}

/// ACPI system power state as reported by the power controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[expect(missing_docs)] // ACPI names.
pub enum PowerState {
    S0,
    S3,
    S4,
    S5,
    G3,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Operating system family running on the SUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    /// Any Linux distribution.
    Linux,
    /// Windows client or server.
    Windows,
    /// An environment without sleep/health tooling (UEFI shell, ESXi, ...).
    Other,
}

/// The power transition requested for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[expect(missing_docs)] // Self-describing names.
pub enum ResetKind {
    WarmReset,
    ColdReset,
    GracefulS5,
    GracefulG3,
    SurpriseReset,
    SurpriseS5,
    SurpriseG3,
    S3,
    S4,
    IpmiCycle,
}

impl ResetKind {
    /// All kinds, in the order they are documented.
    pub const ALL: [ResetKind; 10] = [
        Self::WarmReset,
        Self::ColdReset,
        Self::GracefulS5,
        Self::GracefulG3,
        Self::SurpriseReset,
        Self::SurpriseS5,
        Self::SurpriseG3,
        Self::S3,
        Self::S4,
        Self::IpmiCycle,
    ];

    /// The configuration name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WarmReset => "warm_reset",
            Self::ColdReset => "cold_reset",
            Self::GracefulS5 => "graceful_s5",
            Self::GracefulG3 => "graceful_g3",
            Self::SurpriseReset => "surprise_reset",
            Self::SurpriseS5 => "surprise_s5",
            Self::SurpriseG3 => "surprise_g3",
            Self::S3 => "s3",
            Self::S4 => "s4",
            Self::IpmiCycle => "ipmi_cycle",
        }
    }
}

impl fmt::Display for ResetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Error returned when parsing an unknown [`ResetKind`].
#[derive(Debug, thiserror::Error)]
#[error("unknown reset kind `{0}`")]
pub struct UnknownResetKind(String);

impl FromStr for ResetKind {
    type Err = UnknownResetKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| UnknownResetKind(s.to_owned()))
    }
}

/// A single BIOS (or FPGA) POST code byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PostCode(pub u8);

impl fmt::Display for PostCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

/// Error returned when parsing a malformed [`PostCode`].
#[derive(Debug, thiserror::Error)]
#[error("`{0}` is not a two digit hex post code")]
pub struct InvalidPostCode(String);

impl FromStr for PostCode {
    type Err = InvalidPostCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.is_empty() || digits.len() > 2 {
            return Err(InvalidPostCode(s.to_owned()));
        }
        u8::from_str_radix(digits, 16)
            .map(PostCode)
            .map_err(|_| InvalidPostCode(s.to_owned()))
    }
}

impl TryFrom<String> for PostCode {
    type Error = InvalidPostCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PostCode> for String {
    fn from(value: PostCode) -> Self {
        value.to_string()
    }
}

/// One read of the post-code display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostCodeReading {
    /// BIOS post code.
    pub bios: PostCode,
    /// FPGA post code, on platforms that expose one.
    pub fpga: Option<PostCode>,
}

impl fmt::Display for PostCodeReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fpga {
            Some(fpga) => write!(f, "BIOS={} FPGA={}", self.bios, fpga),
            None => write!(f, "BIOS={}", self.bios),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PostCode;
    use super::ResetKind;
    use super::ResetStatus;

    #[test]
    fn post_codes_parse_with_and_without_prefix() {
        assert_eq!("0x3a".parse::<PostCode>().unwrap(), PostCode(0x3a));
        assert_eq!("B2".parse::<PostCode>().unwrap(), PostCode(0xb2));
        assert_eq!(" 7 ".parse::<PostCode>().unwrap(), PostCode(0x07));
        assert!("".parse::<PostCode>().is_err());
        assert!("123".parse::<PostCode>().is_err());
        assert!("zz".parse::<PostCode>().is_err());
    }

    #[test]
    fn post_code_display_is_upper_hex() {
        assert_eq!(PostCode(0x0b).to_string(), "0B");
    }

    #[test]
    fn reset_kind_names_round_trip() {
        for kind in ResetKind::ALL {
            assert_eq!(kind.name().parse::<ResetKind>().unwrap(), kind);
        }
        assert_eq!(
            "Surprise-G3".parse::<ResetKind>().unwrap(),
            ResetKind::SurpriseG3
        );
        assert!("s6".parse::<ResetKind>().is_err());
    }

    #[test]
    fn status_display_matches_ledger_vocabulary() {
        assert_eq!(ResetStatus::OsNotAlive.to_string(), "OS_NOT_ALIVE");
        assert!(ResetStatus::Success.is_success());
        assert!(!ResetStatus::PcStuck.is_success());
    }
}
