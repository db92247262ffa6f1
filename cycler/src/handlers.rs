// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-status handling of a finished transition: ledger row, counters,
//! diagnostics, stop policy and recovery.

use crate::Cycle;
use crate::CycleError;
use crate::CyclingCampaign;
use crate::Recovery;
use crate::ResetKind;
use crate::ResetStatus;
use crate::StopReason;
use crate::config::ConfigError;
use crate::config::Named;
use crate::config::Selection;
use crate::diagnostics::check_mce_log;
use crate::diagnostics::collect_silicon_dumps;
use crate::health;
use crate::health::HealthCheckKind;
use serde::Serialize;
use serde::Serializer;
use std::fmt;
use std::str::FromStr;

/// Power cycles attempted to bring the SUT back after a failure.
const NUMBER_OF_RECOVERY_ATTEMPTS: u32 = 5;

/// A category of failure that can stop a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(try_from = "String")]
pub enum FailureClass {
    /// Any failure at all.
    Any,
    /// DC or AC power failures.
    BootFailure,
    /// A stuck post code.
    PcStuck,
    /// The OS did not come back.
    OsNotAlive,
    /// The platform never reached the requested power state.
    StateChange,
    /// One health check.
    HealthCheck(HealthCheckKind),
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Any => "any",
            Self::BootFailure => "boot_failure",
            Self::PcStuck => "pc_stuck",
            Self::OsNotAlive => "os_not_alive",
            Self::StateChange => "state_change",
            Self::HealthCheck(kind) => kind.name(),
        })
    }
}

impl FromStr for FailureClass {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        let class = match wanted.as_str() {
            "any" => Self::Any,
            "boot_failure" => Self::BootFailure,
            "pc_stuck" => Self::PcStuck,
            "os_not_alive" => Self::OsNotAlive,
            "state_change" => Self::StateChange,
            _ => match wanted.parse::<Selection<HealthCheckKind>>() {
                Ok(Selection::One(kind)) => Self::HealthCheck(kind),
                _ => {
                    return Err(ConfigError::UnknownName {
                        what: "failure class",
                        name: s.to_owned(),
                    });
                }
            },
        };
        Ok(class)
    }
}

impl TryFrom<String> for FailureClass {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for FailureClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What the campaign does after a cycle has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Run the next cycle.
    Continue,
    /// End the campaign.
    Stop(StopReason),
}

/// How a handled cycle ends.
struct Outcome {
    passed: bool,
    remarks: String,
    stop_on: Option<FailureClass>,
    recover: bool,
}

impl Outcome {
    /// A failed cycle that stops on `class` (or `any`) and otherwise
    /// recovers.
    fn failed(remarks: impl Into<String>, class: FailureClass) -> Self {
        Self {
            passed: false,
            remarks: remarks.into(),
            stop_on: Some(class),
            recover: true,
        }
    }
}

impl CyclingCampaign {
    /// Route the result of a transition to its handler.
    pub(crate) fn dispatch(
        &mut self,
        cycle: Cycle,
        result: Result<ResetStatus, CycleError>,
    ) -> Result<NextStep, CycleError> {
        match result {
            Ok(ResetStatus::Success) => self.handle_reset_success(cycle),
            Ok(ResetStatus::PcStuck) => self.handle_reset_pc_stuck_failure(cycle),
            Ok(ResetStatus::DcFailure) => self.handle_reset_dc_failure(cycle),
            Ok(ResetStatus::AcFailure) => self.handle_reset_ac_failure(cycle),
            Ok(ResetStatus::StateChangeFailure) => self.handle_reset_state_change_failure(cycle),
            Ok(ResetStatus::OsNotAlive) => self.handle_reset_os_not_alive_failure(cycle),
            Err(err) => self.default_reset_handler(cycle, err),
        }
    }

    fn handle_reset_success(&mut self, cycle: Cycle) -> Result<NextStep, CycleError> {
        let mut errors = Vec::new();

        if !self.engine.config().ignore_mce_errors {
            let os = self.engine.sut_mut().os.as_mut();
            if os.is_alive() {
                match check_mce_log(os) {
                    Ok(mce) if mce.is_empty() => {}
                    Ok(mce) => {
                        tracing::error!(
                            cycle = cycle.number(),
                            "machine check errors logged:\n{}",
                            mce.join("\n")
                        );
                        errors.push(HealthCheckKind::Mce);
                    }
                    Err(e) => tracing::warn!(
                        error = e.as_ref() as &dyn std::error::Error,
                        "could not read the machine check log"
                    ),
                }
            } else {
                tracing::error!("could not check machine check errors, SUT is not reachable");
            }
        }

        if self.engine.config().health_check {
            let mut ctx =
                self.engine
                    .health_context(&self.health_dir, cycle.number(), cycle.kind());
            let result = self.health.run(&mut ctx);
            for kind in result.failures() {
                if !errors.contains(&kind) {
                    errors.push(kind);
                }
            }
        }

        let outcome = if errors.is_empty() {
            tracing::info!(cycle = cycle.number(), "cycle succeeded");
            Outcome {
                passed: true,
                remarks: "No Errors".into(),
                stop_on: None,
                recover: false,
            }
        } else {
            let labels: Vec<&str> = errors.iter().map(|kind| kind.label()).collect();
            tracing::error!(cycle = cycle.number(), errors = ?labels, "cycle failed health checks");
            self.dump_silicon_state(cycle.number());
            Outcome {
                passed: false,
                remarks: format!("Health Check Errors:{}", labels.join("|")),
                stop_on: errors
                    .iter()
                    .map(|kind| FailureClass::HealthCheck(*kind))
                    .find(|class| self.engine.config().stops_on(*class)),
                recover: false,
            }
        };

        let recover = !self.engine.validate_sut_state();
        self.conclude(cycle, Outcome { recover, ..outcome })
    }

    fn handle_reset_dc_failure(&mut self, cycle: Cycle) -> Result<NextStep, CycleError> {
        self.dmi_diagnostic(&cycle);
        self.conclude(
            cycle,
            Outcome::failed("DC Power failure", FailureClass::BootFailure),
        )
    }

    fn handle_reset_ac_failure(&mut self, cycle: Cycle) -> Result<NextStep, CycleError> {
        self.dmi_diagnostic(&cycle);
        self.conclude(
            cycle,
            Outcome::failed("AC Power failure", FailureClass::BootFailure),
        )
    }

    fn handle_reset_pc_stuck_failure(&mut self, cycle: Cycle) -> Result<NextStep, CycleError> {
        let code = cycle.failed_post_code();
        tracing::error!(
            cycle = cycle.number(),
            post_code = ?code,
            boot_flow = ?cycle.boot_flow(),
            "SUT is stuck at post code"
        );
        self.dmi_diagnostic(&cycle);
        if let Some(code) = code {
            let dir = self
                .logs
                .root()
                .join(format!("analyzers_cycle{}", cycle.number()));
            self.triage
                .collect(self.engine.sut_mut().silicon.as_mut(), code, &dir);
        }
        let at = code.map_or_else(|| "unknown".to_owned(), |code| code.to_string());
        self.conclude(
            cycle,
            Outcome::failed(format!("PC Stuck at {at}"), FailureClass::PcStuck),
        )
    }

    fn handle_reset_os_not_alive_failure(&mut self, cycle: Cycle) -> Result<NextStep, CycleError> {
        self.dmi_diagnostic(&cycle);
        self.conclude(
            cycle,
            Outcome::failed("SUT failed to BOOT to OS", FailureClass::OsNotAlive),
        )
    }

    fn handle_reset_state_change_failure(&mut self, cycle: Cycle) -> Result<NextStep, CycleError> {
        self.dmi_diagnostic(&cycle);
        self.conclude(
            cycle,
            Outcome::failed(
                "SUT state did not change to expected state",
                FailureClass::StateChange,
            ),
        )
    }

    /// The engine itself failed. The cycle is recorded, then the error ends
    /// the campaign.
    fn default_reset_handler(&mut self, cycle: Cycle, err: CycleError) -> Result<NextStep, CycleError> {
        tracing::error!(
            cycle = cycle.number(),
            error = &err as &dyn std::error::Error,
            "cycle failed with an unexpected error"
        );
        self.dmi_diagnostic(&cycle);
        self.conclude(
            cycle,
            Outcome {
                passed: false,
                remarks: format!("Unexpected error: {err:#}"),
                stop_on: None,
                recover: false,
            },
        )?;
        Err(err)
    }

    /// Update counters, recover if needed and append the ledger row.
    fn conclude(&mut self, cycle: Cycle, outcome: Outcome) -> Result<NextStep, CycleError> {
        let number = cycle.number();
        let previous = if outcome.passed {
            None
        } else {
            self.previous_failure
        };

        let stop = outcome
            .stop_on
            .filter(|class| self.engine.config().stops_on(*class));
        let (next, recovery) = if let Some(class) = stop {
            tracing::warn!(cycle = number, %class, "stopping on failure");
            (NextStep::Stop(StopReason::StopOnFailure(class)), None)
        } else if outcome.recover {
            let recovery = self.prepare_sut_for_retrigger();
            let next = if recovery.recovered {
                NextStep::Continue
            } else {
                NextStep::Stop(StopReason::RecoveryFailed)
            };
            (next, Some(recovery))
        } else {
            (NextStep::Continue, None)
        };

        if outcome.passed {
            self.succeeded += 1;
        } else {
            self.failed += 1;
            self.failures.push(format!(
                "Cycle #{number}: {}. Previous failure was at cycle #{}",
                outcome.remarks,
                previous.unwrap_or(0)
            ));
            self.previous_failure = Some(number);
        }

        let record = cycle.finalize(outcome.passed, previous, outcome.remarks, recovery);
        self.summary.append(&record)?;
        self.records.push(record);
        Ok(next)
    }

    /// Power cycle the SUT until the OS answers again.
    fn prepare_sut_for_retrigger(&mut self) -> Recovery {
        tracing::info!("preparing the SUT for the next cycle");
        for attempt in 1..=NUMBER_OF_RECOVERY_ATTEMPTS {
            let mut scratch = Cycle::new(0, ResetKind::SurpriseG3, self.engine.now());
            match self.engine.surprise_g3(&mut scratch) {
                Ok(status) => tracing::debug!(attempt, %status, "recovery power cycle finished"),
                Err(e) => tracing::warn!(
                    attempt,
                    error = &e as &dyn std::error::Error,
                    "recovery power cycle failed"
                ),
            }
            if self.engine.validate_sut_state() {
                tracing::info!(attempt, "SUT booted to OS");
                return Recovery {
                    attempts: attempt,
                    recovered: true,
                };
            }
            tracing::error!(attempt, "SUT did not boot to OS");
        }
        tracing::error!("SUT did not boot to OS after {NUMBER_OF_RECOVERY_ATTEMPTS} attempts");
        Recovery {
            attempts: NUMBER_OF_RECOVERY_ATTEMPTS,
            recovered: false,
        }
    }

    fn dmi_diagnostic(&mut self, cycle: &Cycle) {
        let mut ctx = self
            .engine
            .health_context(&self.health_dir, cycle.number(), cycle.kind());
        match health::dmi_status(&mut ctx) {
            Ok(true) => tracing::debug!("DMI error status clear"),
            Ok(false) => tracing::warn!(cycle = cycle.number(), "DMI errors present"),
            Err(e) => tracing::warn!(
                error = e.as_ref() as &dyn std::error::Error,
                "could not read DMI error status"
            ),
        }
    }

    fn dump_silicon_state(&mut self, number: u32) {
        let domains = Selection::expand(&self.engine.config().dump_domains);
        if domains.is_empty() {
            return;
        }
        let dir = self.logs.root().join(format!("silicon_dump_{number}"));
        collect_silicon_dumps(self.engine.sut_mut().silicon.as_mut(), &domains, &dir);
    }
}
