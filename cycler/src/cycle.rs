// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::BootFlow;
use crate::PostCode;
use crate::ResetKind;
use crate::ResetStatus;
use jiff::Timestamp;
use serde::Serialize;
use std::time::Duration;

/// One in-flight attempt to take the SUT through a transition and back.
///
/// Operations record where a failure happened; the cycle is consumed by
/// [`Cycle::finalize`] once its outcome has been decided.
#[derive(Debug)]
pub struct Cycle {
    number: u32,
    kind: ResetKind,
    started_at: Timestamp,
    started: Duration,
    status: Option<ResetStatus>,
    failed_post_code: Option<PostCode>,
    boot_flow: Option<BootFlow>,
    boot_time: Option<Duration>,
}

impl Cycle {
    /// Start cycle `number` at monotonic time `now`.
    pub fn new(number: u32, kind: ResetKind, now: Duration) -> Self {
        Self {
            number,
            kind,
            started_at: Timestamp::now(),
            started: now,
            status: None,
            failed_post_code: None,
            boot_flow: None,
            boot_time: None,
        }
    }

    /// Cycle number, starting at 1.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// The requested transition.
    pub fn kind(&self) -> ResetKind {
        self.kind
    }

    /// The post code the SUT stopped at, if any.
    pub fn failed_post_code(&self) -> Option<PostCode> {
        self.failed_post_code
    }

    /// Boot flow direction at the failure point.
    pub fn boot_flow(&self) -> Option<BootFlow> {
        self.boot_flow
    }

    /// Time from cycle start to the end of the transition.
    pub fn boot_time(&self) -> Option<Duration> {
        self.boot_time
    }

    pub(crate) fn record_failure_point(&mut self, post_code: Option<PostCode>, flow: BootFlow) {
        self.failed_post_code = post_code;
        self.boot_flow = Some(flow);
    }

    pub(crate) fn complete(&mut self, status: ResetStatus, now: Duration) {
        self.status = Some(status);
        self.boot_time = Some(now.saturating_sub(self.started));
    }

    /// Freeze the cycle into its ledger record.
    pub(crate) fn finalize(
        self,
        passed: bool,
        previous_failure: Option<u32>,
        remarks: String,
        recovery: Option<Recovery>,
    ) -> CycleRecord {
        let remarks = match recovery {
            Some(Recovery {
                attempts,
                recovered: true,
            }) => format!("{remarks}; recovered after {attempts} attempt(s)"),
            Some(Recovery {
                attempts,
                recovered: false,
            }) => format!("{remarks}; recovery failed after {attempts} attempt(s)"),
            None => remarks,
        };
        CycleRecord {
            number: self.number,
            kind: self.kind,
            status: self.status,
            started_at: self.started_at,
            boot_time_secs: self.boot_time.map(|t| t.as_secs_f64()),
            failed_post_code: self.failed_post_code,
            boot_flow: self.boot_flow,
            passed,
            previous_failure,
            remarks,
            recovery,
        }
    }
}

/// Recovery performed after a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recovery {
    /// Power cycles attempted.
    pub attempts: u32,
    /// Whether the OS came back.
    pub recovered: bool,
}

/// The immutable record of a completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    /// Cycle number.
    pub number: u32,
    /// Requested transition.
    pub kind: ResetKind,
    /// Classified outcome; absent when the engine itself failed.
    pub status: Option<ResetStatus>,
    /// Wall-clock start of the cycle.
    pub started_at: Timestamp,
    /// Seconds from start to the end of the transition.
    pub boot_time_secs: Option<f64>,
    /// Post code at the failure point.
    pub failed_post_code: Option<PostCode>,
    /// Boot flow direction at the failure point.
    pub boot_flow: Option<BootFlow>,
    /// Whether the cycle counts as a success.
    pub passed: bool,
    /// The most recent earlier failed cycle.
    pub previous_failure: Option<u32>,
    /// Human readable outcome.
    pub remarks: String,
    /// Recovery performed after a failure.
    pub recovery: Option<Recovery>,
}

#[cfg(test)]
mod tests {
    use super::Cycle;
    use super::Recovery;
    use crate::BootFlow;
    use crate::PostCode;
    use crate::ResetKind;
    use crate::ResetStatus;
    use std::time::Duration;

    #[test]
    fn finalize_carries_failure_point_and_recovery() {
        let mut cycle = Cycle::new(7, ResetKind::GracefulS5, Duration::from_secs(100));
        cycle.record_failure_point(Some(PostCode(0xb2)), BootFlow::PowerOn);
        cycle.complete(ResetStatus::PcStuck, Duration::from_secs(400));

        let record = cycle.finalize(
            false,
            Some(3),
            "PC Stuck at B2".into(),
            Some(Recovery {
                attempts: 2,
                recovered: true,
            }),
        );

        assert_eq!(record.number, 7);
        assert_eq!(record.status, Some(ResetStatus::PcStuck));
        assert_eq!(record.boot_time_secs, Some(300.0));
        assert_eq!(record.failed_post_code, Some(PostCode(0xb2)));
        assert_eq!(record.boot_flow, Some(BootFlow::PowerOn));
        assert_eq!(record.remarks, "PC Stuck at B2; recovered after 2 attempt(s)");
    }
}
