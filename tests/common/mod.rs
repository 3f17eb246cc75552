#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use obswatch::bus::{
    ParkReport, ParkState, ParkTarget, PeerEvent, PropertyBus, PropertyState, PARK_ELEMENT,
};
use obswatch::config::{ServerSettings, ShutdownStep, ShutdownSteps, ShutdownTrigger, ShutdownTriggers, WatchdogConfig};
use obswatch::error::{BusError, ScriptError};
use obswatch::protocol::{Command, CommandType};
use obswatch::script::{ScriptOutcome, ScriptRunner};
use obswatch::weather::WeatherState;
use obswatch::Watchdog;

pub const TELESCOPE: &str = "Telescope Simulator";
pub const DOME: &str = "Dome Simulator";
pub const WEATHER: &str = "Weather Simulator";
pub const SCRIPT: &str = "/usr/local/bin/observatory-off";

/// In-memory property bus. Records every write; park states are set by the test.
#[derive(Debug, Default)]
pub struct MockBus {
    pub connected: bool,
    /// `connect` completes immediately instead of staying pending.
    pub connect_succeeds: bool,
    pub refuse_connect: bool,
    pub connect_calls: u32,
    pub snoops: Vec<(String, String)>,
    pub switches: Vec<(String, String, String)>,
    pub parks: HashMap<(String, ParkTarget), ParkState>,
}

impl MockBus {
    pub fn online() -> Self {
        Self {
            connected: true,
            connect_succeeds: true,
            ..Self::default()
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn set_park(&mut self, device: &str, target: ParkTarget, state: ParkState) {
        self.parks.insert((device.to_string(), target), state);
    }

    pub fn park_commands(&self, target: ParkTarget) -> usize {
        self.switches
            .iter()
            .filter(|(_, property, element)| property == target.property() && element == PARK_ELEMENT)
            .count()
    }
}

impl PropertyBus for MockBus {
    fn connect(&mut self, _server: &ServerSettings) -> Result<(), BusError> {
        self.connect_calls += 1;
        if self.refuse_connect {
            return Err(BusError::LinkClosed);
        }
        if self.connect_succeeds {
            self.connected = true;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn snoop(&mut self, device: &str, property: &str) -> Result<(), BusError> {
        self.snoops.push((device.to_string(), property.to_string()));
        Ok(())
    }

    fn set_switch(&mut self, device: &str, property: &str, element: &str) -> Result<(), BusError> {
        if !self.connected {
            return Err(BusError::NotConnected);
        }
        self.switches
            .push((device.to_string(), property.to_string(), element.to_string()));
        Ok(())
    }

    fn park_state(&self, device: &str, target: ParkTarget) -> ParkState {
        self.parks
            .get(&(device.to_string(), target))
            .copied()
            .unwrap_or_default()
    }
}

/// Script runner returning scripted outcomes, exit 0 once they run out.
#[derive(Debug, Default)]
pub struct FakeRunner {
    pub outcomes: VecDeque<ScriptOutcome>,
    pub runs: Vec<PathBuf>,
}

impl FakeRunner {
    pub fn exiting(code: i32) -> Self {
        Self {
            outcomes: VecDeque::from([ScriptOutcome::Exited(code)]),
            runs: Vec::new(),
        }
    }
}

impl ScriptRunner for FakeRunner {
    fn run(&mut self, path: &Path) -> Result<ScriptOutcome, ScriptError> {
        self.runs.push(path.to_path_buf());
        Ok(self.outcomes.pop_front().unwrap_or(ScriptOutcome::Exited(0)))
    }
}

pub fn config(steps: &[ShutdownStep], triggers: &[ShutdownTrigger]) -> WatchdogConfig {
    WatchdogConfig {
        heartbeat_timeout_seconds: 60,
        steps: ShutdownSteps::from_steps(steps),
        triggers: ShutdownTriggers::from_triggers(triggers),
        script_path: Some(PathBuf::from(SCRIPT)),
        ..WatchdogConfig::default()
    }
}

pub fn connected(config: WatchdogConfig, bus: MockBus, runner: FakeRunner) -> Watchdog<MockBus, FakeRunner> {
    let mut watchdog = Watchdog::with_runner(config, bus, runner);
    watchdog.connect(0).unwrap();
    watchdog
}

pub fn command(id: u32, command_type: CommandType) -> Command {
    Command {
        id,
        timestamp: 0,
        command_type,
    }
}

pub fn weather(state: WeatherState) -> PeerEvent {
    PeerEvent::Weather {
        device: WEATHER.to_string(),
        state,
    }
}

pub fn park_report(target: ParkTarget, parked: bool) -> PeerEvent {
    let device = match target {
        ParkTarget::Mount => TELESCOPE,
        ParkTarget::Dome => DOME,
    };
    PeerEvent::Park {
        target,
        report: ParkReport {
            device: device.to_string(),
            state: PropertyState::Ok,
            parked: Some(parked),
        },
    }
}
