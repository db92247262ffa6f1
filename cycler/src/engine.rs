// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The reset/power-transition state machine.

use crate::BootFlow;
use crate::Cycle;
use crate::CycleError;
use crate::OsFamily;
use crate::PostCode;
use crate::PowerState;
use crate::ResetKind;
use crate::ResetStatus;
use crate::clock::Clock;
use crate::config::CyclingConfig;
use crate::health::HealthContext;
use crate::health::NON_STICKY_SCRATCHPAD;
use crate::health::RESET_MARKER;
use crate::health::STICKY_SCRATCHPAD;
use crate::sut::Sut;
use std::path::Path;
use std::time::Duration;

/// Time spent powered off in S5 during a surprise S5.
const SX_SLEEP_TIME: Duration = Duration::from_secs(150);
/// Delay after a reset before watching the boot.
const POST_SLEEP_DELAY: Duration = Duration::from_secs(30);
/// Settle time passed to the AC switch.
const AC_POWER_DELAY: Duration = Duration::from_secs(20);
/// Power button press length.
const DC_POWER_DELAY: Duration = Duration::from_secs(5);
/// Time spent in G3 during a surprise G3.
const AC_OFF_DWELL: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 5;
const SHUTDOWN_POLLS: u32 = 4;
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(30);
const S5_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const AC_RETRY_DELAY: Duration = Duration::from_secs(10);
const AC_STATE_POLL: Duration = Duration::from_secs(2);
const SX_RESIDENCY: Duration = Duration::from_secs(10);
const MACHINE_CHECK_SETTLE: Duration = Duration::from_secs(30);
const SLEEP_STATE_POLL: Duration = Duration::from_secs(5);
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CMD_TIMEOUT: Duration = Duration::from_secs(30);

const LINUX_SLEEP_CMD: &str = "sudo systemctl suspend";
const LINUX_HIBERNATE_CMD: &str = "sudo systemctl hibernate";
const WINDOWS_SLEEP_CMD: &str = "RUNDLL32.EXE powrprof.dll,SetSuspendState 0,1,0";
const WINDOWS_HIBERNATE_CMD: &str = "shutdown /h";
const COLD_RESET_CMD_LINUX: &str = "outb 0xcf9 0xe";
const ENABLE_HIBERNATE_CMD: &str = "powercfg /H ON";
const DISABLE_HIBERNATE_CMD: &str = "powercfg /H OFF";
const LIST_SLEEP_STATES_CMD: &str = "powercfg /a";
const SLEEP_STATES_NOT_AVAILABLE: &str =
    "The following sleep states are not available on this system:";

/// Whether `powercfg /a` output lists hibernation as available.
fn hibernate_available(report: &str) -> bool {
    report
        .split(SLEEP_STATES_NOT_AVAILABLE)
        .next()
        .is_some_and(|available| available.contains("Hibernate"))
}

/// Drives the SUT through power transitions and classifies each attempt.
///
/// Every operation returns a [`ResetStatus`] for expected hardware failure
/// modes and reserves [`CycleError`] for unsupported requests, hard state
/// verification failures and collaborator breakage.
pub struct ResetEngine {
    sut: Sut,
    config: CyclingConfig,
    clock: Box<dyn Clock>,
}

impl ResetEngine {
    /// Creates an engine for `sut`.
    pub fn new(sut: Sut, config: CyclingConfig, clock: Box<dyn Clock>) -> Self {
        Self { sut, config, clock }
    }

    /// The SUT collaborators.
    pub fn sut_mut(&mut self) -> &mut Sut {
        &mut self.sut
    }

    /// The cycling configuration.
    pub fn config(&self) -> &CyclingConfig {
        &self.config
    }

    /// Current monotonic time.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// A health check context for `cycle` writing evidence to `dir`.
    pub fn health_context<'a>(
        &'a mut self,
        dir: &'a Path,
        cycle: u32,
        kind: ResetKind,
    ) -> HealthContext<'a> {
        HealthContext {
            sut: &mut self.sut,
            clock: self.clock.as_ref(),
            dir,
            cycle,
            kind,
        }
    }

    /// Perform the transition `kind`.
    pub fn perform(&mut self, kind: ResetKind, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        match kind {
            ResetKind::WarmReset => self.warm_reset(cycle),
            ResetKind::ColdReset => self.cold_reset(cycle),
            ResetKind::GracefulS5 => self.graceful_s5(cycle),
            ResetKind::GracefulG3 => self.graceful_g3(cycle),
            ResetKind::SurpriseReset => self.surprise_reset(cycle),
            ResetKind::SurpriseS5 => self.surprise_s5(cycle),
            ResetKind::SurpriseG3 => self.surprise_g3(cycle),
            ResetKind::S3 => self.perform_s3_cycle(cycle),
            ResetKind::S4 => self.perform_s4_cycle(cycle),
            ResetKind::IpmiCycle => self.ipmi_cycle(cycle),
        }
    }

    /// Whether the SUT is in the state a new cycle expects.
    pub fn validate_sut_state(&mut self) -> bool {
        self.sut.os.is_alive()
    }

    /// Write the reset marker into the sticky and non-sticky BIOS
    /// scratchpads so the memory reset check can tell what survived.
    pub fn set_register_before_reset(&mut self) -> anyhow::Result<()> {
        let silicon = &mut self.sut.silicon;
        let sockets = silicon.socket_count()?;
        for socket in 0..sockets {
            silicon.write_register(socket, STICKY_SCRATCHPAD, RESET_MARKER)?;
            silicon.write_register(socket, NON_STICKY_SCRATCHPAD, RESET_MARKER)?;
        }
        tracing::debug!(
            sockets,
            marker = format_args!("{RESET_MARKER:#x}"),
            "reset marker written"
        );
        Ok(())
    }

    /// Reboot through the OS.
    pub fn warm_reset(&mut self, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        if let Err(e) = self.sut.os.reboot() {
            tracing::info!(
                error = e.as_ref() as &dyn std::error::Error,
                "reboot dropped the connection, as expected"
            );
        }
        self.clock.sleep(POST_SLEEP_DELAY);
        Ok(self.wait_for_os(cycle))
    }

    /// Full platform reset: port CF9 on Linux, the reset button elsewhere.
    pub fn cold_reset(&mut self, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        if !self.sut.os.is_alive() {
            tracing::error!("SUT is not up, cannot issue a cold reset");
            return Ok(ResetStatus::OsNotAlive);
        }
        match self.sut.os.os_family() {
            OsFamily::Linux => {
                self.sut
                    .os
                    .spawn_detached(COLD_RESET_CMD_LINUX)
                    .map_err(|e| CycleError::TestFail(format!("unable to issue cold reset: {e:#}")))?;
            }
            OsFamily::Windows | OsFamily::Other => {
                if let Err(e) = self.sut.power.dc_power_reset() {
                    tracing::error!(
                        error = e.as_ref() as &dyn std::error::Error,
                        "reset button press failed"
                    );
                    return Ok(ResetStatus::DcFailure);
                }
            }
        }
        self.clock.sleep(POST_SLEEP_DELAY);
        Ok(self.wait_for_os(cycle))
    }

    /// Shut down through the OS, press the power button and wait for boot.
    pub fn graceful_s5(&mut self, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        if let Some(status) = self.enter_s5(cycle)? {
            return Ok(status);
        }
        if !self.perform_dc_on() {
            tracing::error!("failed to power on the SUT");
            return Ok(ResetStatus::DcFailure);
        }
        if self.config.machine_check_break {
            self.arm_machine_check_break();
        }
        let status = self.wait_for_os(cycle);
        if !status.is_success() {
            return Ok(status);
        }
        self.confirm_s0()
    }

    /// Shut down through the OS, then remove and restore AC power.
    pub fn graceful_g3(&mut self, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        if let Some(status) = self.enter_s5(cycle)? {
            return Ok(status);
        }
        self.surprise_g3(cycle)
    }

    /// Press the reset button.
    pub fn surprise_reset(&mut self, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        tracing::info!("resetting the SUT with the reset button");
        if let Err(e) = self.sut.power.dc_power_reset() {
            tracing::error!(
                error = e.as_ref() as &dyn std::error::Error,
                "reset button press failed"
            );
            return Ok(ResetStatus::DcFailure);
        }
        self.clock.sleep(POST_SLEEP_DELAY);
        Ok(self.wait_for_os(cycle))
    }

    /// Hold the power button to force S5, then press it again.
    pub fn surprise_s5(&mut self, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        match self.sut.power.dc_power_off(DC_POWER_DELAY) {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!("power button hold did not turn the SUT off");
                return Ok(ResetStatus::DcFailure);
            }
            Err(e) => {
                tracing::error!(
                    error = e.as_ref() as &dyn std::error::Error,
                    "power button hold failed"
                );
                return Ok(ResetStatus::DcFailure);
            }
        }
        self.clock.sleep(SX_SLEEP_TIME);
        if !self.perform_dc_on() {
            tracing::error!("failed to power on the SUT");
            return Ok(ResetStatus::DcFailure);
        }
        Ok(self.wait_for_os(cycle))
    }

    /// Remove AC power from the running SUT, restore it and wait for boot.
    pub fn surprise_g3(&mut self, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        let status = self.switch_ac(false);
        if !status.is_success() {
            return Ok(status);
        }
        self.clock.sleep(AC_OFF_DWELL);
        let status = self.switch_ac(true);
        if !status.is_success() {
            return Ok(status);
        }
        self.clock.sleep(self.config.platform.ac_restore_settle());
        let status = self.wait_for_os(cycle);
        if !status.is_success() {
            return Ok(status);
        }
        self.confirm_s0()
    }

    /// Suspend to RAM and wake with the power button.
    pub fn perform_s3_cycle(&mut self, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        self.sleep_state_cycle(cycle, PowerState::S3)
    }

    /// Hibernate and wake with the power button.
    pub fn perform_s4_cycle(&mut self, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        self.sleep_state_cycle(cycle, PowerState::S4)
    }

    /// Chassis power cycle through the BMC.
    pub fn ipmi_cycle(&mut self, cycle: &mut Cycle) -> Result<ResetStatus, CycleError> {
        if let Err(e) = self.sut.power.power_cycle() {
            tracing::error!(
                error = e.as_ref() as &dyn std::error::Error,
                "chassis power cycle failed"
            );
            return Ok(ResetStatus::DcFailure);
        }
        self.clock.sleep(POST_SLEEP_DELAY);
        let status = self.wait_for_os(cycle);
        if !status.is_success() {
            return Ok(status);
        }
        self.confirm_s0()
    }

    /// Turn hibernation on (Windows) and verify it is offered.
    pub fn enable_hibernate_mode(&mut self) -> Result<(), CycleError> {
        self.set_hibernate_mode(true)
    }

    /// Turn hibernation off (Windows) and verify it is no longer offered.
    pub fn disable_hibernate_mode(&mut self) -> Result<(), CycleError> {
        self.set_hibernate_mode(false)
    }

    fn set_hibernate_mode(&mut self, enable: bool) -> Result<(), CycleError> {
        let cmd = if enable {
            ENABLE_HIBERNATE_CMD
        } else {
            DISABLE_HIBERNATE_CMD
        };
        let report = self
            .sut
            .os
            .execute_stdout(cmd, CMD_TIMEOUT)
            .and_then(|_| self.sut.os.execute_stdout(LIST_SLEEP_STATES_CMD, CMD_TIMEOUT))
            .map_err(|e| CycleError::TestError(format!("{cmd} failed: {e:#}")))?;
        if hibernate_available(&report) != enable {
            return Err(CycleError::TestError(format!(
                "hibernate mode is not {} on this system",
                if enable { "enabled" } else { "disabled" }
            )));
        }
        tracing::info!(enable, "hibernate mode set");
        Ok(())
    }

    /// Wait for the OS to come back, watching post codes when the platform
    /// has a reader.
    pub fn wait_for_os(&mut self, cycle: &mut Cycle) -> ResetStatus {
        let reboot_timeout = self.config.timeouts.reboot();
        let stuck_timeout = self.config.timeouts.post_code_stuck();
        let start = self.clock.now();

        let mut last = self.sut.read_post_code();
        let post_codes_available = last.is_some();
        if post_codes_available {
            let poll = self.config.timeouts.post_code_poll().max(MIN_POLL_INTERVAL);
            let mut previous: Option<PostCode> = None;
            let mut unchanged_since = start;
            loop {
                let now = self.clock.now();
                match self.sut.read_post_code() {
                    Some(reading) => {
                        tracing::debug!(post_code = %reading, "post code");
                        last = Some(reading);
                        if previous == Some(reading.bios) {
                            if now.saturating_sub(unchanged_since) > stuck_timeout {
                                tracing::error!(
                                    post_code = %reading.bios,
                                    timeout = ?stuck_timeout,
                                    "SUT is stuck at post code"
                                );
                                break;
                            }
                        } else {
                            previous = Some(reading.bios);
                            unchanged_since = now;
                        }
                    }
                    None => tracing::warn!("unable to read the post code"),
                }
                if self.sut.os.is_alive() || now.saturating_sub(start) >= reboot_timeout {
                    break;
                }
                self.clock.sleep(poll);
            }
            if let Some(reading) = self.sut.read_post_code() {
                last = Some(reading);
            }
        } else {
            tracing::info!("post codes not available, waiting for the OS");
            let poll = self.config.timeouts.os_poll().max(MIN_POLL_INTERVAL);
            while !self.sut.os.is_alive() && self.clock.now().saturating_sub(start) < reboot_timeout
            {
                self.clock.sleep(poll);
            }
        }

        if self.sut.os.is_alive() {
            tracing::info!(elapsed = ?self.clock.now().saturating_sub(start), "SUT booted to OS");
            return ResetStatus::Success;
        }

        let code = last.map(|reading| reading.bios);
        match code {
            Some(code) if self.config.os_post_codes.contains(&code) => tracing::error!(
                post_code = %code,
                "SUT booted to OS but its network service failed"
            ),
            Some(code) => tracing::error!(
                post_code = %code,
                timeout = ?reboot_timeout,
                "SUT failed to boot to OS"
            ),
            None => tracing::error!(timeout = ?reboot_timeout, "SUT failed to boot to OS"),
        }
        cycle.record_failure_point(code, BootFlow::PowerOn);
        if code.is_some() {
            ResetStatus::PcStuck
        } else {
            ResetStatus::OsNotAlive
        }
    }

    /// Shut the SUT down gracefully. Returns `Some` with the failure status
    /// if it did not reach S5.
    fn enter_s5(&mut self, cycle: &mut Cycle) -> Result<Option<ResetStatus>, CycleError> {
        if !self.sut.os.is_alive() {
            tracing::error!("SUT is not up, cannot execute the shutdown command");
            return Ok(Some(ResetStatus::OsNotAlive));
        }
        if !self.shutdown_sut()? {
            return Ok(Some(self.classify_power_off_failure(cycle)));
        }
        tracing::info!("SUT is in S5");
        Ok(None)
    }

    /// Shut down through the OS, then confirm S5. A state mismatch goes
    /// through `fail_or_log` once, after the last check.
    fn shutdown_sut(&mut self) -> Result<bool, CycleError> {
        let mut down = false;
        for attempt in 1..=MAX_ATTEMPTS {
            tracing::info!(attempt, "shutting down the SUT");
            if let Err(e) = self.sut.os.shutdown() {
                tracing::warn!(
                    attempt,
                    error = e.as_ref() as &dyn std::error::Error,
                    "shutdown command failed"
                );
            }
            for _ in 0..SHUTDOWN_POLLS {
                if !self.sut.os.is_alive() {
                    down = true;
                    break;
                }
                self.clock.sleep(SHUTDOWN_POLL_INTERVAL);
            }
            if down {
                break;
            }
            self.clock.sleep(SHUTDOWN_POLL_INTERVAL);
        }
        if !down {
            tracing::error!("failed to shut down the SUT");
        }

        for attempt in 1..=MAX_ATTEMPTS {
            let state = self.sut.power.power_state()?;
            if state == PowerState::S5 {
                return Ok(true);
            }
            tracing::debug!(attempt, %state, "waiting for S5");
            if attempt == MAX_ATTEMPTS {
                self.fail_or_log(format!(
                    "SUT did not enter {}, actual state is {state}",
                    PowerState::S5
                ))?;
            } else {
                self.clock.sleep(S5_CHECK_INTERVAL);
            }
        }
        Ok(false)
    }

    fn perform_dc_on(&mut self) -> bool {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.sut.power.dc_power_on(DC_POWER_DELAY) {
                Ok(true) => {
                    tracing::info!(attempt, "DC power on succeeded");
                    return true;
                }
                Ok(false) => tracing::warn!(attempt, "DC power on did not take"),
                Err(e) => tracing::warn!(
                    attempt,
                    error = e.as_ref() as &dyn std::error::Error,
                    "DC power on failed"
                ),
            }
        }
        tracing::error!("failed to DC power on the SUT");
        false
    }

    /// Switch AC power and wait for the switch to report the new state.
    fn switch_ac(&mut self, on: bool) -> ResetStatus {
        let mut switched = false;
        for attempt in 1..=MAX_ATTEMPTS {
            let result = if on {
                self.sut.power.ac_power_on(AC_POWER_DELAY)
            } else {
                self.sut.power.ac_power_off(AC_POWER_DELAY)
            };
            match result {
                Ok(true) => {
                    switched = true;
                    break;
                }
                Ok(false) => {
                    tracing::warn!(attempt, on, "AC switch did not take");
                    self.clock.sleep(AC_RETRY_DELAY);
                }
                Err(e) => tracing::error!(
                    attempt,
                    on,
                    error = e.as_ref() as &dyn std::error::Error,
                    "AC switch failed"
                ),
            }
        }
        if !switched {
            tracing::error!(on, "AC switch failed after {MAX_ATTEMPTS} attempts");
            return ResetStatus::AcFailure;
        }

        for attempt in 1..=MAX_ATTEMPTS {
            match self.sut.power.ac_power_state() {
                Ok(state) if state == on => return ResetStatus::Success,
                Ok(_) => tracing::debug!(attempt, on, "AC state not reached yet"),
                Err(e) => tracing::error!(
                    attempt,
                    error = e.as_ref() as &dyn std::error::Error,
                    "failed to read AC state"
                ),
            }
            self.clock.sleep(AC_STATE_POLL);
        }
        tracing::error!(on, "AC state did not change");
        ResetStatus::StateChangeFailure
    }

    /// Enter S3 or S4 from the OS and wake with the power button.
    fn sleep_state_cycle(
        &mut self,
        cycle: &mut Cycle,
        target: PowerState,
    ) -> Result<ResetStatus, CycleError> {
        let os = self.sut.os.os_family();
        let (operation, cmd) = match (target, os) {
            (PowerState::S4, OsFamily::Linux) => ("hibernate", LINUX_HIBERNATE_CMD),
            (PowerState::S4, OsFamily::Windows) => ("hibernate", WINDOWS_HIBERNATE_CMD),
            (PowerState::S4, OsFamily::Other) => {
                return Err(CycleError::Unsupported {
                    operation: "hibernate",
                    os,
                });
            }
            (_, OsFamily::Linux) => ("sleep", LINUX_SLEEP_CMD),
            (_, OsFamily::Windows) => ("sleep", WINDOWS_SLEEP_CMD),
            (_, OsFamily::Other) => {
                return Err(CycleError::Unsupported {
                    operation: "sleep",
                    os,
                });
            }
        };

        if !self.sut.os.is_alive() {
            tracing::error!(operation, "SUT OS is not reachable");
            return Ok(ResetStatus::OsNotAlive);
        }
        if target == PowerState::S4 && os == OsFamily::Windows {
            self.enable_hibernate_mode()?;
        }
        tracing::info!(cmd, "sending the SUT to {target}");
        self.sut
            .os
            .spawn_detached(cmd)
            .map_err(|e| CycleError::TestFail(format!("unable to execute {operation} command: {e:#}")))?;

        let start = self.clock.now();
        let timeout = self.config.timeouts.state_change();
        let mut state = self.sut.power.power_state()?;
        while state == PowerState::S0 {
            if self.clock.now().saturating_sub(start) >= timeout {
                self.fail_or_log(format!("SUT did not enter {target}, actual state is {state}"))?;
                return Ok(self.classify_power_off_failure(cycle));
            }
            self.clock.sleep(SLEEP_STATE_POLL);
            state = self.sut.power.power_state()?;
        }
        tracing::info!(%state, "SUT left S0");

        self.clock.sleep(SX_RESIDENCY);
        if !self.perform_dc_on() {
            tracing::error!("power button press to wake the SUT failed");
        }
        self.clock.sleep(DC_POWER_DELAY);
        let state = self.sut.power.power_state()?;
        if state != PowerState::S0 {
            tracing::error!(%state, "SUT did not return to S0 after wake");
            return Ok(self.classify_power_off_failure(cycle));
        }
        Ok(self.wait_for_os(cycle))
    }

    /// A transition stalled while powering down: a readable post code means
    /// the BIOS is hung there.
    fn classify_power_off_failure(&mut self, cycle: &mut Cycle) -> ResetStatus {
        match self.sut.read_post_code() {
            Some(reading) => {
                tracing::info!(post_code = %reading, "post code at failure");
                cycle.record_failure_point(Some(reading.bios), BootFlow::PowerOff);
                ResetStatus::PcStuck
            }
            None => {
                tracing::error!("unable to read the post code");
                ResetStatus::StateChangeFailure
            }
        }
    }

    /// Verify the SUT reports S0 and let services settle.
    fn confirm_s0(&mut self) -> Result<ResetStatus, CycleError> {
        let state = self.sut.power.power_state()?;
        if state != PowerState::S0 {
            self.fail_or_log(format!(
                "SUT did not enter {}, actual state is {state}",
                PowerState::S0
            ))?;
            return Ok(ResetStatus::StateChangeFailure);
        }
        tracing::info!("SUT is in S0 and the network is up");
        self.clock.sleep(self.config.timeouts.boot_settle());
        Ok(ResetStatus::Success)
    }

    /// Halt, arm break-on-machine-check and resume. The SUT is always
    /// resumed, even if arming failed.
    fn arm_machine_check_break(&mut self) {
        self.clock.sleep(MACHINE_CHECK_SETTLE);
        let silicon = &mut self.sut.silicon;
        if let Err(e) = silicon
            .halt()
            .and_then(|()| silicon.set_machine_check_break(true))
        {
            tracing::error!(
                error = e.as_ref() as &dyn std::error::Error,
                "unable to arm machine check break"
            );
        }
        if let Err(e) = silicon.resume() {
            tracing::error!(
                error = e.as_ref() as &dyn std::error::Error,
                "failed to resume the SUT"
            );
        }
    }

    fn fail_or_log(&self, message: String) -> Result<(), CycleError> {
        if self.config.fail_on_state_mismatch {
            Err(CycleError::TestFail(message))
        } else {
            tracing::error!("{message}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ResetEngine;
    use super::hibernate_available;
    use crate::BootFlow;
    use crate::Cycle;
    use crate::CycleError;
    use crate::OsFamily;
    use crate::PostCode;
    use crate::PowerState;
    use crate::ResetKind;
    use crate::ResetStatus;
    use crate::clock::Clock;
    use crate::clock::FakeClock;
    use crate::config::CyclingConfig;
    use crate::config::Timeouts;
    use crate::health::NON_STICKY_SCRATCHPAD;
    use crate::health::RESET_MARKER;
    use crate::health::STICKY_SCRATCHPAD;
    use crate::sut::fake::Shared;
    use crate::sut::fake::fake_sut;
    use std::time::Duration;

    const POWERCFG_HIBERNATE: &str = "\
The following sleep states are available on this system:
    Standby (S3)
    Hibernate
The following sleep states are not available on this system:
    Standby (S1)";

    const POWERCFG_NO_HIBERNATE: &str = "\
The following sleep states are available on this system:
    Standby (S3)
The following sleep states are not available on this system:
    Hibernate
        Hibernation has not been enabled.";

    fn config() -> CyclingConfig {
        CyclingConfig {
            timeouts: Timeouts {
                reboot_secs: 60,
                state_change_secs: 30,
                ..Timeouts::default()
            },
            ..CyclingConfig::default()
        }
    }

    fn test_engine(os: OsFamily, config: CyclingConfig) -> (ResetEngine, Shared, FakeClock) {
        let (sut, state) = fake_sut(os);
        let clock = FakeClock::default();
        let engine = ResetEngine::new(sut, config, Box::new(clock.clone()));
        (engine, state, clock)
    }

    fn run(engine: &mut ResetEngine, kind: ResetKind) -> (Result<ResetStatus, CycleError>, Cycle) {
        let mut cycle = Cycle::new(1, kind, engine.now());
        let status = engine.perform(kind, &mut cycle);
        (status, cycle)
    }

    #[test_with_tracing::test]
    fn warm_reset_boots_back() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        let (status, cycle) = run(&mut engine, ResetKind::WarmReset);
        assert_eq!(status.unwrap(), ResetStatus::Success);
        assert_eq!(state.borrow().count("reboot"), 1);
        assert_eq!(cycle.failed_post_code(), None);
    }

    #[test_with_tracing::test]
    fn boot_failure_without_post_codes_is_os_not_alive() {
        let (mut engine, state, clock) = test_engine(OsFamily::Linux, config());
        state.borrow_mut().boot_outcomes.push_back(false);

        let (status, cycle) = run(&mut engine, ResetKind::WarmReset);

        assert_eq!(status.unwrap(), ResetStatus::OsNotAlive);
        assert_eq!(cycle.boot_flow(), Some(BootFlow::PowerOn));
        assert_eq!(cycle.failed_post_code(), None);
        assert!(clock.now() >= Duration::from_secs(30 + 60));
    }

    #[test_with_tracing::test]
    fn boot_failure_with_post_code_is_pc_stuck() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        {
            let mut state = state.borrow_mut();
            state.boot_outcomes.push_back(false);
            state.post_code = Some(PostCode(0xb2));
        }

        let (status, cycle) = run(&mut engine, ResetKind::SurpriseReset);

        assert_eq!(status.unwrap(), ResetStatus::PcStuck);
        assert_eq!(cycle.failed_post_code(), Some(PostCode(0xb2)));
        assert_eq!(cycle.boot_flow(), Some(BootFlow::PowerOn));
    }

    #[test_with_tracing::test]
    fn unchanged_post_code_stops_waiting_early() {
        let mut config = config();
        config.timeouts.reboot_secs = 600;
        config.timeouts.post_code_stuck_secs = 20;
        let (mut engine, state, clock) = test_engine(OsFamily::Linux, config);
        {
            let mut state = state.borrow_mut();
            state.boot_outcomes.push_back(false);
            state.post_code = Some(PostCode(0x7f));
        }

        let (status, _) = run(&mut engine, ResetKind::SurpriseReset);

        assert_eq!(status.unwrap(), ResetStatus::PcStuck);
        assert!(clock.now() < Duration::from_secs(30 + 60));
    }

    #[test_with_tracing::test]
    fn graceful_s5_arms_machine_check_break() {
        let mut config = config();
        config.machine_check_break = true;
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config);

        let (status, _) = run(&mut engine, ResetKind::GracefulS5);

        assert_eq!(status.unwrap(), ResetStatus::Success);
        let events = state.borrow().events.clone();
        let expected = ["shutdown", "dc_on", "boot", "halt", "mcbreak:true", "resume"];
        assert_eq!(events, expected);
    }

    #[test_with_tracing::test]
    fn graceful_s5_shutdown_failure_classification() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        state.borrow_mut().ignore_shutdown = true;
        let (status, _) = run(&mut engine, ResetKind::GracefulS5);
        assert_eq!(status.unwrap(), ResetStatus::StateChangeFailure);
        assert_eq!(state.borrow().count("shutdown"), 5);
        // Five S5 checks and no second look after them.
        assert_eq!(state.borrow().power_state_reads, 5);

        state.borrow_mut().post_code = Some(PostCode(0xa0));
        let (status, cycle) = run(&mut engine, ResetKind::GracefulG3);
        assert_eq!(status.unwrap(), ResetStatus::PcStuck);
        assert_eq!(cycle.boot_flow(), Some(BootFlow::PowerOff));
        assert_eq!(cycle.failed_post_code(), Some(PostCode(0xa0)));
    }

    #[test_with_tracing::test]
    fn state_mismatch_can_be_fatal() {
        let mut config = config();
        config.fail_on_state_mismatch = true;
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config);
        state.borrow_mut().ignore_shutdown = true;

        let (status, _) = run(&mut engine, ResetKind::GracefulS5);

        assert!(matches!(status, Err(CycleError::TestFail(_))));
    }

    #[test_with_tracing::test]
    fn graceful_s5_not_alive_does_nothing() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        state.borrow_mut().os_up = false;
        let (status, _) = run(&mut engine, ResetKind::GracefulS5);
        assert_eq!(status.unwrap(), ResetStatus::OsNotAlive);
        assert!(state.borrow().events.is_empty());
    }

    #[test_with_tracing::test]
    fn surprise_g3_cycles_ac() {
        let (mut engine, state, _) = test_engine(OsFamily::Windows, config());
        let (status, _) = run(&mut engine, ResetKind::SurpriseG3);
        assert_eq!(status.unwrap(), ResetStatus::Success);
        assert_eq!(state.borrow().events, ["ac_off", "ac_on", "boot"]);
    }

    #[test_with_tracing::test]
    fn stuck_ac_switch_is_ac_failure() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        state.borrow_mut().ac_switch_fails = true;
        let (status, _) = run(&mut engine, ResetKind::SurpriseG3);
        assert_eq!(status.unwrap(), ResetStatus::AcFailure);
        assert_eq!(state.borrow().count("ac_off"), 5);
        assert_eq!(state.borrow().count("ac_on"), 0);
    }

    #[test_with_tracing::test]
    fn g3_with_wrong_final_state_is_state_change_failure() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        state.borrow_mut().stuck_power_state = Some(PowerState::S5);
        let (status, _) = run(&mut engine, ResetKind::SurpriseG3);
        assert_eq!(status.unwrap(), ResetStatus::StateChangeFailure);
    }

    #[test_with_tracing::test]
    fn surprise_s5_retries_dc_on() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        state.borrow_mut().dc_on_failures = 4;
        let (status, _) = run(&mut engine, ResetKind::SurpriseS5);
        assert_eq!(status.unwrap(), ResetStatus::Success);
        assert_eq!(state.borrow().count("dc_on"), 5);

        state.borrow_mut().dc_on_failures = 5;
        let (status, _) = run(&mut engine, ResetKind::SurpriseS5);
        assert_eq!(status.unwrap(), ResetStatus::DcFailure);
    }

    #[test_with_tracing::test]
    fn cold_reset_uses_cf9_on_linux_and_reset_button_elsewhere() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        let (status, _) = run(&mut engine, ResetKind::ColdReset);
        assert_eq!(status.unwrap(), ResetStatus::Success);
        assert_eq!(state.borrow().events, ["spawn:outb 0xcf9 0xe", "boot"]);

        let (mut engine, state, _) = test_engine(OsFamily::Windows, config());
        state.borrow_mut().dc_reset_fails = true;
        let (status, _) = run(&mut engine, ResetKind::ColdReset);
        assert_eq!(status.unwrap(), ResetStatus::DcFailure);
    }

    #[test_with_tracing::test]
    fn s3_round_trip_on_linux() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        let (status, _) = run(&mut engine, ResetKind::S3);
        assert_eq!(status.unwrap(), ResetStatus::Success);
        assert_eq!(
            state.borrow().events,
            ["spawn:sudo systemctl suspend", "dc_on", "boot"]
        );
    }

    #[test_with_tracing::test]
    fn sleep_that_never_leaves_s0_times_out() {
        let (mut engine, state, clock) = test_engine(OsFamily::Linux, config());
        state.borrow_mut().ignore_sleep = true;
        let (status, _) = run(&mut engine, ResetKind::S3);
        assert_eq!(status.unwrap(), ResetStatus::StateChangeFailure);
        assert!(clock.now() >= Duration::from_secs(30));
        assert_eq!(state.borrow().count("dc_on"), 0);
    }

    #[test_with_tracing::test]
    fn sleep_requires_a_running_supported_os() {
        let (mut engine, _, _) = test_engine(OsFamily::Other, config());
        let (status, _) = run(&mut engine, ResetKind::S4);
        assert!(matches!(
            status,
            Err(CycleError::Unsupported {
                operation: "hibernate",
                os: OsFamily::Other
            })
        ));

        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        state.borrow_mut().os_up = false;
        let (status, _) = run(&mut engine, ResetKind::S3);
        assert_eq!(status.unwrap(), ResetStatus::OsNotAlive);
    }

    #[test_with_tracing::test]
    fn windows_s4_enables_hibernation_first() {
        let (mut engine, state, _) = test_engine(OsFamily::Windows, config());
        state
            .borrow_mut()
            .respond("powercfg /a", 0, POWERCFG_HIBERNATE);
        let (status, _) = run(&mut engine, ResetKind::S4);
        assert_eq!(status.unwrap(), ResetStatus::Success);
        let commands = state.borrow().commands.clone();
        assert_eq!(commands[..3], ["powercfg /H ON", "powercfg /a", "shutdown /h"]);

        let (mut engine, state, _) = test_engine(OsFamily::Windows, config());
        state
            .borrow_mut()
            .respond("powercfg /a", 0, POWERCFG_NO_HIBERNATE);
        let (status, _) = run(&mut engine, ResetKind::S4);
        assert!(matches!(status, Err(CycleError::TestError(_))));
        assert!(engine.disable_hibernate_mode().is_ok());
    }

    #[test]
    fn hibernate_listing() {
        assert!(hibernate_available(POWERCFG_HIBERNATE));
        assert!(!hibernate_available(POWERCFG_NO_HIBERNATE));
    }

    #[test_with_tracing::test]
    fn ipmi_cycle_boots_back() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        let (status, _) = run(&mut engine, ResetKind::IpmiCycle);
        assert_eq!(status.unwrap(), ResetStatus::Success);
        assert_eq!(state.borrow().events, ["power_cycle", "boot"]);
    }

    #[test_with_tracing::test]
    fn reset_marker_goes_to_both_scratchpads_on_every_socket() {
        let (mut engine, state, _) = test_engine(OsFamily::Linux, config());
        state.borrow_mut().sockets = 4;
        engine.set_register_before_reset().unwrap();
        let state = state.borrow();
        for socket in 0..4 {
            assert_eq!(
                state.registers[&(socket, STICKY_SCRATCHPAD.to_owned())],
                RESET_MARKER
            );
            assert_eq!(
                state.registers[&(socket, NON_STICKY_SCRATCHPAD.to_owned())],
                RESET_MARKER
            );
        }
        assert_eq!(state.registers.len(), 8);
    }
}
