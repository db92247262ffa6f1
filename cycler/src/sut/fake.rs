// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A scripted in-memory platform for unit tests.

use super::CommandOutput;
use super::DebugReport;
use super::PlatformInventory;
use super::PostCodeReader;
use super::PowerControl;
use super::SiliconDebug;
use super::Sut;
use super::SutOs;
use crate::OsFamily;
use crate::PostCode;
use crate::PostCodeReading;
use crate::PowerState;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

/// Shared state of the fake platform.
pub(crate) struct FakeState {
    pub os: OsFamily,
    pub os_up: bool,
    pub power: PowerState,
    pub ac_on: bool,
    /// Consumed on every boot; `false` leaves the OS down. Empty means boot.
    pub boot_outcomes: VecDeque<bool>,
    /// Post code shown while the OS is down.
    pub post_code: Option<PostCode>,
    /// Overrides the simulated power state when set.
    pub stuck_power_state: Option<PowerState>,
    pub ignore_shutdown: bool,
    pub ignore_sleep: bool,
    pub dc_on_failures: u32,
    pub dc_reset_fails: bool,
    pub ac_switch_fails: bool,
    /// Substring of a command and the output it produces.
    pub responses: Vec<(String, CommandOutput)>,
    pub registers: HashMap<(u32, String), u64>,
    pub captures: HashMap<String, String>,
    pub inventory: Option<PlatformInventory>,
    pub sockets: u32,
    pub power_state_reads: u32,
    pub analyzer_fails: bool,
    pub commands: Vec<String>,
    pub events: Vec<String>,
}

pub(crate) type Shared = Rc<RefCell<FakeState>>;

impl FakeState {
    fn boot(&mut self) {
        self.power = PowerState::S0;
        let ok = self.boot_outcomes.pop_front().unwrap_or(true);
        self.os_up = ok;
        self.events.push(if ok { "boot" } else { "boot_failed" }.into());
    }

    fn power_off(&mut self, state: PowerState) {
        self.os_up = false;
        self.power = state;
    }

    pub(crate) fn respond(&mut self, pattern: &str, status: i32, stdout: &str) {
        self.responses.push((
            pattern.into(),
            CommandOutput {
                status,
                stdout: stdout.into(),
                stderr: String::new(),
            },
        ));
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.events.iter().filter(|e| *e == event).count()
    }
}

/// A healthy, running Linux platform.
pub(crate) fn fake_sut(os: OsFamily) -> (Sut, Shared) {
    let state = Rc::new(RefCell::new(FakeState {
        os,
        os_up: true,
        power: PowerState::S0,
        ac_on: true,
        boot_outcomes: VecDeque::new(),
        post_code: None,
        stuck_power_state: None,
        ignore_shutdown: false,
        ignore_sleep: false,
        dc_on_failures: 0,
        dc_reset_fails: false,
        ac_switch_fails: false,
        responses: Vec::new(),
        registers: HashMap::new(),
        captures: HashMap::new(),
        inventory: None,
        sockets: 2,
        power_state_reads: 0,
        analyzer_fails: false,
        commands: Vec::new(),
        events: Vec::new(),
    }));
    let sut = Sut::new(
        Box::new(FakeOs(state.clone())),
        Box::new(FakePower(state.clone())),
    )
    .with_post_codes(Box::new(FakePostCodes(state.clone())))
    .with_silicon_debug(Box::new(FakeSilicon(state.clone())));
    (sut, state)
}

struct FakeOs(Shared);

impl SutOs for FakeOs {
    fn os_family(&self) -> OsFamily {
        self.0.borrow().os
    }

    fn execute(&mut self, cmd: &str, _timeout: Duration) -> anyhow::Result<CommandOutput> {
        let mut state = self.0.borrow_mut();
        if !state.os_up {
            anyhow::bail!("connection refused");
        }
        state.commands.push(cmd.into());
        Ok(state
            .responses
            .iter()
            .find(|(pattern, _)| cmd.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or(CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            }))
    }

    fn spawn_detached(&mut self, cmd: &str) -> anyhow::Result<()> {
        let mut state = self.0.borrow_mut();
        if !state.os_up {
            anyhow::bail!("connection refused");
        }
        state.commands.push(cmd.into());
        state.events.push(format!("spawn:{cmd}"));
        if state.ignore_sleep {
            return Ok(());
        }
        if cmd.contains("suspend") || cmd.contains("SetSuspendState") {
            state.power_off(PowerState::S3);
        } else if cmd.contains("hibernate") || cmd.contains("shutdown /h") {
            state.power_off(PowerState::S4);
        } else if cmd.contains("0xcf9") {
            state.boot();
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.0.borrow().os_up
    }

    fn reboot(&mut self) -> anyhow::Result<()> {
        let mut state = self.0.borrow_mut();
        state.events.push("reboot".into());
        state.boot();
        anyhow::bail!("connection closed by remote host")
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        let mut state = self.0.borrow_mut();
        state.events.push("shutdown".into());
        if !state.ignore_shutdown {
            state.power_off(PowerState::S5);
        }
        Ok(())
    }
}

struct FakePower(Shared);

impl PowerControl for FakePower {
    fn dc_power_on(&mut self, _press: Duration) -> anyhow::Result<bool> {
        let mut state = self.0.borrow_mut();
        state.events.push("dc_on".into());
        if state.dc_on_failures > 0 {
            state.dc_on_failures -= 1;
            anyhow::bail!("BMC did not answer");
        }
        state.boot();
        Ok(true)
    }

    fn dc_power_off(&mut self, _press: Duration) -> anyhow::Result<bool> {
        let mut state = self.0.borrow_mut();
        state.events.push("dc_off".into());
        state.power_off(PowerState::S5);
        Ok(true)
    }

    fn dc_power_reset(&mut self) -> anyhow::Result<()> {
        let mut state = self.0.borrow_mut();
        state.events.push("dc_reset".into());
        if state.dc_reset_fails {
            anyhow::bail!("BMC did not answer");
        }
        state.boot();
        Ok(())
    }

    fn power_cycle(&mut self) -> anyhow::Result<()> {
        let mut state = self.0.borrow_mut();
        state.events.push("power_cycle".into());
        state.boot();
        Ok(())
    }

    fn ac_power_on(&mut self, _settle: Duration) -> anyhow::Result<bool> {
        let mut state = self.0.borrow_mut();
        state.events.push("ac_on".into());
        if state.ac_switch_fails {
            return Ok(false);
        }
        state.ac_on = true;
        state.boot();
        Ok(true)
    }

    fn ac_power_off(&mut self, _settle: Duration) -> anyhow::Result<bool> {
        let mut state = self.0.borrow_mut();
        state.events.push("ac_off".into());
        if state.ac_switch_fails {
            return Ok(false);
        }
        state.ac_on = false;
        state.power_off(PowerState::G3);
        Ok(true)
    }

    fn ac_power_state(&mut self) -> anyhow::Result<bool> {
        Ok(self.0.borrow().ac_on)
    }

    fn power_state(&mut self) -> anyhow::Result<PowerState> {
        let mut state = self.0.borrow_mut();
        state.power_state_reads += 1;
        Ok(state.stuck_power_state.unwrap_or(state.power))
    }
}

struct FakePostCodes(Shared);

impl PostCodeReader for FakePostCodes {
    fn read(&mut self) -> anyhow::Result<Option<PostCodeReading>> {
        Ok(self
            .0
            .borrow()
            .post_code
            .map(|bios| PostCodeReading { bios, fpga: None }))
    }
}

struct FakeSilicon(Shared);

impl SiliconDebug for FakeSilicon {
    fn socket_count(&mut self) -> anyhow::Result<u32> {
        Ok(self.0.borrow().sockets)
    }

    fn read_register(&mut self, socket: u32, path: &str) -> anyhow::Result<u64> {
        self.0
            .borrow()
            .registers
            .get(&(socket, path.to_owned()))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no register {path} on socket {socket}"))
    }

    fn write_register(&mut self, socket: u32, path: &str, value: u64) -> anyhow::Result<()> {
        self.0
            .borrow_mut()
            .registers
            .insert((socket, path.to_owned()), value);
        Ok(())
    }

    fn capture(&mut self, report: DebugReport) -> anyhow::Result<String> {
        let key = format!("{report:?}");
        let mut state = self.0.borrow_mut();
        state.events.push(format!("capture:{key}"));
        state
            .captures
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no capture for {key}"))
    }

    fn inventory(&mut self) -> anyhow::Result<PlatformInventory> {
        self.0
            .borrow()
            .inventory
            .ok_or_else(|| anyhow::anyhow!("no inventory"))
    }

    fn halt(&mut self) -> anyhow::Result<()> {
        self.0.borrow_mut().events.push("halt".into());
        Ok(())
    }

    fn resume(&mut self) -> anyhow::Result<()> {
        self.0.borrow_mut().events.push("resume".into());
        Ok(())
    }

    fn set_machine_check_break(&mut self, enabled: bool) -> anyhow::Result<()> {
        self.0
            .borrow_mut()
            .events
            .push(format!("mcbreak:{enabled}"));
        Ok(())
    }

    fn collect_analyzer_logs(
        &mut self,
        _analyzers: &[String],
        post_code: PostCode,
        _dir: &Path,
    ) -> anyhow::Result<()> {
        let mut state = self.0.borrow_mut();
        state.events.push(format!("analyze:{post_code}"));
        if state.analyzer_fails {
            anyhow::bail!("analyzer crashed");
        }
        Ok(())
    }
}
