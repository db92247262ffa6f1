// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The cycle loop.

use crate::Cycle;
use crate::CycleError;
use crate::CycleLogSource;
use crate::CycleRecord;
use crate::FailureClass;
use crate::NextStep;
use crate::OsFamily;
use crate::ResetEngine;
use crate::ResetKind;
use crate::config::Selection;
use crate::diagnostics::PostCodeTriage;
use crate::diagnostics::clear_mce_log;
use crate::health::HealthChecks;
use crate::health::MemoryCheck;
use crate::summary::CyclingSummary;
use crate::summary::SUMMARY_FILE;
use serde::Serialize;
use std::path::PathBuf;

/// Why a campaign ended before running every requested cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A failure in the configured stop-on-failure list.
    StopOnFailure(FailureClass),
    /// The SUT could not be brought back to the OS.
    RecoveryFailed,
}

/// Outcome of a campaign.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    /// Transition that was cycled.
    pub kind: ResetKind,
    /// Cycles requested.
    pub requested: u32,
    /// Cycles that ran to a ledger row.
    pub completed: u32,
    /// Cycles that succeeded.
    pub succeeded: u32,
    /// Cycles that failed.
    pub failed: u32,
    /// One message per failed cycle.
    pub failures: Vec<String>,
    /// Why the campaign stopped early, if it did.
    pub stop: Option<StopReason>,
    /// Every cycle record, in order.
    pub records: Vec<CycleRecord>,
}

impl CampaignReport {
    /// Whether every requested cycle ran and none failed.
    pub fn passed(&self) -> bool {
        self.failed == 0 && self.stop.is_none() && self.completed == self.requested
    }
}

type CycleHook = Box<dyn FnMut(&mut ResetEngine, &CycleRecord) -> anyhow::Result<()>>;

/// Runs cycles of one transition kind, handling each outcome and keeping the
/// ledger.
pub struct CyclingCampaign {
    pub(crate) engine: ResetEngine,
    pub(crate) health: HealthChecks,
    pub(crate) summary: CyclingSummary,
    pub(crate) logs: CycleLogSource,
    pub(crate) health_dir: PathBuf,
    pub(crate) triage: PostCodeTriage,
    pub(crate) succeeded: u32,
    pub(crate) failed: u32,
    pub(crate) previous_failure: Option<u32>,
    pub(crate) failures: Vec<String>,
    pub(crate) records: Vec<CycleRecord>,
    during_cycle: Option<CycleHook>,
}

impl CyclingCampaign {
    /// A campaign writing its ledger and evidence under `logs`, with the
    /// health checks named in the engine's configuration.
    pub fn new(engine: ResetEngine, logs: CycleLogSource) -> anyhow::Result<Self> {
        let config = engine.config();
        let health = HealthChecks::from_config(config);
        let triage = PostCodeTriage::new(
            config.analyzer_names(),
            config.ignore_post_codes.iter().copied(),
        );
        let summary = CyclingSummary::create(&logs.root().join(SUMMARY_FILE))?;
        let health_dir = logs.health_check_dir()?;
        Ok(Self {
            engine,
            health,
            summary,
            logs,
            health_dir,
            triage,
            succeeded: 0,
            failed: 0,
            previous_failure: None,
            failures: Vec::new(),
            records: Vec::new(),
            during_cycle: None,
        })
    }

    /// Replace the configured health checks.
    pub fn with_health_checks(mut self, health: HealthChecks) -> Self {
        self.health = health;
        self
    }

    /// Run `hook` after every cycle that did not stop the campaign. An
    /// error from the hook ends the campaign.
    pub fn with_during_cycle(
        mut self,
        hook: impl FnMut(&mut ResetEngine, &CycleRecord) -> anyhow::Result<()> + 'static,
    ) -> Self {
        self.during_cycle = Some(Box::new(hook));
        self
    }

    /// Capture health check baselines before the first cycle.
    pub fn prepare(&mut self, kind: ResetKind) {
        if !self.engine.config().health_check {
            return;
        }
        let mut ctx = self.engine.health_context(&self.health_dir, 0, kind);
        self.health.prepare(&mut ctx);
    }

    /// Run up to `cycles` cycles of `kind`.
    ///
    /// Hardware failures are handled and recorded; an engine error is
    /// recorded in the ledger and then returned.
    pub fn run(&mut self, kind: ResetKind, cycles: u32) -> Result<CampaignReport, CycleError> {
        let span = tracing::info_span!("campaign", %kind, cycles);
        let _enter = span.enter();

        let mut stop = None;
        for number in 1..=cycles {
            match self.run_cycle(number, kind)? {
                NextStep::Continue => {
                    if let (Some(hook), Some(record)) = (&mut self.during_cycle, self.records.last()) {
                        hook(&mut self.engine, record)?;
                    }
                }
                NextStep::Stop(reason) => {
                    tracing::warn!(cycle = number, ?reason, "stopping the campaign");
                    stop = Some(reason);
                    break;
                }
            }
        }

        if kind == ResetKind::S4 && self.engine.sut_mut().os.os_family() == OsFamily::Windows {
            if let Err(e) = self.engine.disable_hibernate_mode() {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    "failed to disable hibernate mode"
                );
            }
        }

        let report = self.report(kind, cycles, stop);
        self.log_summary(&report);
        Ok(report)
    }

    fn run_cycle(&mut self, number: u32, kind: ResetKind) -> Result<NextStep, CycleError> {
        let span = tracing::info_span!("cycle", number);
        let _enter = span.enter();
        tracing::info!(%kind, "starting cycle");

        let config = self.engine.config();
        let clear_mce = !config.ignore_mce_errors;
        let reset_check = kind == ResetKind::WarmReset
            && Selection::expand(&config.memory_checks).contains(&MemoryCheck::ResetCheck);

        if clear_mce {
            if let Err(e) = clear_mce_log(self.engine.sut_mut().os.as_mut()) {
                tracing::warn!(
                    error = e.as_ref() as &dyn std::error::Error,
                    "failed to clear the machine check log"
                );
            }
        }
        if reset_check {
            if let Err(e) = self.engine.set_register_before_reset() {
                tracing::error!(
                    error = e.as_ref() as &dyn std::error::Error,
                    "unable to set the warm reset check registers"
                );
            }
        }

        let mut cycle = Cycle::new(number, kind, self.engine.now());
        let result = self.engine.perform(kind, &mut cycle);
        if let Ok(status) = &result {
            cycle.complete(*status, self.engine.now());
            tracing::info!(%status, boot_time = ?cycle.boot_time(), "transition finished");
        }
        self.dispatch(cycle, result)
    }

    /// The campaign outcome so far.
    pub fn report(&self, kind: ResetKind, requested: u32, stop: Option<StopReason>) -> CampaignReport {
        CampaignReport {
            kind,
            requested,
            completed: self.records.len() as u32,
            succeeded: self.succeeded,
            failed: self.failed,
            failures: self.failures.clone(),
            stop,
            records: self.records.clone(),
        }
    }

    fn log_summary(&self, report: &CampaignReport) {
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            completed = report.completed,
            requested = report.requested,
            summary = %self.summary.path().display(),
            "cycling finished"
        );
        if report.failed > 0 {
            tracing::error!("failures:\n{}", report.failures.join("\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CyclingCampaign;
    use super::StopReason;
    use crate::CycleError;
    use crate::CycleLogSource;
    use crate::FailureClass;
    use crate::OsFamily;
    use crate::PostCode;
    use crate::PowerState;
    use crate::Recovery;
    use crate::ResetEngine;
    use crate::ResetKind;
    use crate::clock::FakeClock;
    use crate::config::CyclingConfig;
    use crate::config::Selection;
    use crate::config::Timeouts;
    use crate::diagnostics::DumpDomain;
    use crate::health::HealthCheck;
    use crate::health::HealthCheckKind;
    use crate::health::HealthChecks;
    use crate::health::HealthContext;
    use crate::summary::CyclingSummary;
    use crate::summary::LedgerStatus;
    use crate::summary::SUMMARY_FILE;
    use crate::sut::fake::Shared;
    use crate::sut::fake::fake_sut;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::TempDir;

    struct Failing(HealthCheckKind);

    impl HealthCheck for Failing {
        fn kind(&self) -> HealthCheckKind {
            self.0
        }

        fn check(&mut self, _ctx: &mut HealthContext<'_>) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    fn config() -> CyclingConfig {
        CyclingConfig {
            timeouts: Timeouts {
                reboot_secs: 60,
                ..Timeouts::default()
            },
            ..CyclingConfig::default()
        }
    }

    fn test_campaign(config: CyclingConfig) -> (CyclingCampaign, Shared, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (sut, state) = fake_sut(OsFamily::Linux);
        let engine = ResetEngine::new(sut, config, Box::new(FakeClock::default()));
        let logs = CycleLogSource::new(dir.path()).unwrap();
        let campaign = CyclingCampaign::new(engine, logs)
            .unwrap()
            .with_health_checks(HealthChecks::new(10));
        (campaign, state, dir)
    }

    #[test_with_tracing::test]
    fn every_cycle_gets_one_ledger_row() {
        let (campaign, _, dir) = test_campaign(config());
        let hook_runs = Rc::new(Cell::new(0));
        let runs = hook_runs.clone();
        let mut campaign = campaign.with_during_cycle(move |_, _| {
            runs.set(runs.get() + 1);
            Ok(())
        });
        campaign.prepare(ResetKind::WarmReset);

        let report = campaign.run(ResetKind::WarmReset, 5).unwrap();

        assert!(report.passed());
        assert_eq!(report.succeeded, 5);
        assert_eq!(hook_runs.get(), 5);
        let rows = CyclingSummary::read(&dir.path().join(SUMMARY_FILE)).unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|row| row.status == LedgerStatus::Succeeded));
        assert_eq!(
            rows.iter().map(|row| row.cycle).collect::<Vec<_>>(),
            [1, 2, 3, 4, 5]
        );
    }

    #[test_with_tracing::test]
    fn os_not_alive_is_followed_by_recovery() {
        let (mut campaign, state, dir) = test_campaign(config());
        state.borrow_mut().boot_outcomes.push_back(false);

        let report = campaign.run(ResetKind::WarmReset, 3).unwrap();

        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded + report.failed, report.completed);
        let first = &report.records[0];
        assert!(!first.passed);
        assert_eq!(
            first.recovery,
            Some(Recovery {
                attempts: 1,
                recovered: true
            })
        );
        assert_eq!(
            first.remarks,
            "SUT failed to BOOT to OS; recovered after 1 attempt(s)"
        );
        assert!(report.records[1].passed);

        let events = state.borrow().events.clone();
        let ac_off = events.iter().position(|e| e == "ac_off").unwrap();
        let second_reboot = events.iter().rposition(|e| e == "reboot").unwrap();
        assert!(ac_off < second_reboot);

        let rows = CyclingSummary::read(&dir.path().join(SUMMARY_FILE)).unwrap();
        assert_eq!(rows[0].status, LedgerStatus::Failed);
        assert_eq!(rows[0].previous_failure, Some(0));
    }

    #[test_with_tracing::test]
    fn previous_failure_points_at_last_failed_cycle() {
        let (mut campaign, state, _dir) = test_campaign(config());
        {
            let mut state = state.borrow_mut();
            // cycle 1 fails, recovery boots, cycle 2 fails, recovery boots
            state.boot_outcomes.extend([false, true, false, true]);
        }

        let report = campaign.run(ResetKind::WarmReset, 3).unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(report.records[0].previous_failure, None);
        assert_eq!(report.records[1].previous_failure, Some(1));
        assert_eq!(report.records[2].previous_failure, None);
        assert!(report.failures[1].ends_with("Previous failure was at cycle #1"));
    }

    #[test_with_tracing::test]
    fn stop_on_failure_ends_without_recovery() {
        let mut config = config();
        config.stop_on_failure = vec![FailureClass::OsNotAlive];
        let (mut campaign, state, _dir) = test_campaign(config);
        state.borrow_mut().boot_outcomes.push_back(false);

        let report = campaign.run(ResetKind::WarmReset, 10).unwrap();

        assert_eq!(
            report.stop,
            Some(StopReason::StopOnFailure(FailureClass::OsNotAlive))
        );
        assert_eq!(report.completed, 1);
        assert_eq!(report.records[0].recovery, None);
        assert_eq!(state.borrow().count("ac_off"), 0);
        assert!(!report.passed());
    }

    #[test_with_tracing::test]
    fn failed_recovery_stops_the_campaign() {
        let (mut campaign, state, _dir) = test_campaign(config());
        state.borrow_mut().boot_outcomes.extend([false; 6]);

        let report = campaign.run(ResetKind::WarmReset, 10).unwrap();

        assert_eq!(report.stop, Some(StopReason::RecoveryFailed));
        assert_eq!(
            report.records[0].recovery,
            Some(Recovery {
                attempts: 5,
                recovered: false
            })
        );
    }

    #[test_with_tracing::test]
    fn stuck_post_code_is_analyzed_once() {
        let mut config = config();
        config.analyzers = vec!["ltssm".into()];
        let (mut campaign, state, dir) = test_campaign(config);
        {
            let mut state = state.borrow_mut();
            state.post_code = Some(PostCode(0xb2));
            state.boot_outcomes.extend([false, true, false, true]);
        }

        let report = campaign.run(ResetKind::WarmReset, 2).unwrap();

        assert_eq!(report.records[0].remarks, "PC Stuck at B2; recovered after 1 attempt(s)");
        assert_eq!(state.borrow().count("analyze:B2"), 1);
        assert!(dir.path().join("analyzers_cycle1").exists());
        assert_eq!(report.succeeded + report.failed, report.completed);
    }

    #[test_with_tracing::test]
    fn health_failure_is_recorded_and_dumps_silicon() {
        let mut config = config();
        config.dump_domains = vec![Selection::One(DumpDomain::Mca)];
        config.stop_on_failure = vec![FailureClass::HealthCheck(HealthCheckKind::Pcie)];
        let (campaign, state, dir) = test_campaign(config);
        state
            .borrow_mut()
            .captures
            .insert("Dump(Mca)".into(), "MCi_STATUS=0".into());
        let mut campaign = campaign.with_health_checks(
            HealthChecks::new(10).with_check(Box::new(Failing(HealthCheckKind::Pcie))),
        );

        let report = campaign.run(ResetKind::WarmReset, 4).unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.records[0].remarks, "Health Check Errors:PCIE");
        assert_eq!(
            report.stop,
            Some(StopReason::StopOnFailure(FailureClass::HealthCheck(
                HealthCheckKind::Pcie
            )))
        );
        assert!(dir.path().join("silicon_dump_1").join("mca_dump.log").exists());
    }

    #[test_with_tracing::test]
    fn os_machine_check_errors_fail_the_cycle() {
        let (mut campaign, state, _dir) = test_campaign(config());
        state
            .borrow_mut()
            .respond("dmesg | grep", 0, "mce: [Hardware Error]: CPU 0: Machine Check");

        let report = campaign.run(ResetKind::WarmReset, 1).unwrap();

        assert_eq!(report.records[0].remarks, "Health Check Errors:MCE");
        assert_eq!(report.failed, 1);
    }

    #[test_with_tracing::test]
    fn engine_error_is_recorded_then_returned() {
        let dir = tempfile::tempdir().unwrap();
        let (sut, _) = fake_sut(OsFamily::Other);
        let engine = ResetEngine::new(sut, config(), Box::new(FakeClock::default()));
        let logs = CycleLogSource::new(dir.path()).unwrap();
        let mut campaign = CyclingCampaign::new(engine, logs)
            .unwrap()
            .with_health_checks(HealthChecks::new(10));

        let err = campaign.run(ResetKind::S3, 5).unwrap_err();

        assert!(matches!(err, CycleError::Unsupported { .. }));
        let rows = CyclingSummary::read(&dir.path().join(SUMMARY_FILE)).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].remarks.starts_with("Unexpected error:"), "{}", rows[0].remarks);
    }

    #[test_with_tracing::test]
    fn dc_failures_are_recorded_and_chained() {
        let (mut campaign, state, dir) = test_campaign(config());
        state.borrow_mut().dc_reset_fails = true;

        let report = campaign.run(ResetKind::SurpriseReset, 3).unwrap();

        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 3);
        assert_eq!(report.stop, None);
        assert!(
            report
                .records
                .iter()
                .all(|r| r.remarks == "DC Power failure; recovered after 1 attempt(s)")
        );
        assert_eq!(report.records[2].previous_failure, Some(2));
        assert_eq!(
            report.failures[0],
            "Cycle #1: DC Power failure; recovered after 1 attempt(s). Previous failure was at cycle #0"
        );

        let rows = CyclingSummary::read(&dir.path().join(SUMMARY_FILE)).unwrap();
        assert_eq!(
            rows.iter().map(|row| row.previous_failure).collect::<Vec<_>>(),
            [Some(0), Some(1), Some(2)]
        );
        assert!(rows.iter().all(|row| row.status == LedgerStatus::Failed));
    }

    #[test_with_tracing::test]
    fn ac_failure_stops_on_boot_failure() {
        let mut config = config();
        config.stop_on_failure = vec![FailureClass::BootFailure];
        let (mut campaign, state, dir) = test_campaign(config);
        state.borrow_mut().ac_switch_fails = true;

        let report = campaign.run(ResetKind::SurpriseG3, 10).unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(
            report.stop,
            Some(StopReason::StopOnFailure(FailureClass::BootFailure))
        );
        assert_eq!(report.records[0].remarks, "AC Power failure");
        assert_eq!(report.records[0].recovery, None);
        // Only the cycle's own five switch attempts; no recovery power cycle.
        assert_eq!(state.borrow().count("ac_off"), 5);

        let rows = CyclingSummary::read(&dir.path().join(SUMMARY_FILE)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].remarks, "AC Power failure");
    }

    #[test_with_tracing::test]
    fn dc_failure_stops_on_any() {
        let mut config = config();
        config.stop_on_failure = vec![FailureClass::Any];
        let (mut campaign, state, _dir) = test_campaign(config);
        state.borrow_mut().dc_reset_fails = true;

        let report = campaign.run(ResetKind::SurpriseReset, 4).unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(
            report.stop,
            Some(StopReason::StopOnFailure(FailureClass::BootFailure))
        );
        assert_eq!(report.records[0].remarks, "DC Power failure");
    }

    #[test_with_tracing::test]
    fn platform_stuck_out_of_s0_is_a_state_change_failure() {
        let (mut campaign, state, dir) = test_campaign(config());
        state.borrow_mut().stuck_power_state = Some(PowerState::S5);

        let report = campaign.run(ResetKind::SurpriseG3, 2).unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(
            report.records[0].remarks,
            "SUT state did not change to expected state; recovered after 1 attempt(s)"
        );
        assert_eq!(report.records[1].previous_failure, Some(1));

        let rows = CyclingSummary::read(&dir.path().join(SUMMARY_FILE)).unwrap();
        assert_eq!(rows[1].previous_failure, Some(1));
        assert!(rows[1].remarks.starts_with("SUT state did not change"));
    }
}
