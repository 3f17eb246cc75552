//! Shutdown orchestration.
//!
//! A polled state machine that sequences park mount, park dome and the
//! shutdown script across peer devices it does not own:
//!
//! ```text
//!  Idle ──trigger──▶ AwaitingPeerConnection ──connected──▶ ParkingMount
//!                                                   │          │ mount parked
//!                                                   │          ▼
//!                                                   ├──────▶ ParkingDome
//!                                                   │          │ dome parked
//!                                                   │          ▼
//!                                                   └──────▶ RunningScript ──exit 0──▶ Complete
//!                                                                          └─exit≠0──▶ Error
//! ```
//!
//! Disabled steps are skipped. Park writes are fire-and-forget; completion is
//! inferred by polling the peer's park state on each tick. Once a sequence has
//! started it runs to `Complete` or `Error` regardless of what the triggers do
//! afterwards.

use std::fmt;

use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bus::{ParkState, ParkTarget, PropertyBus, PropertyState};
use crate::config::{MountPolicy, WatchdogConfig};
use crate::script::{ScriptOutcome, ScriptRunner};

const MAX_SHUTDOWN_HISTORY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownCause {
    HeartbeatLoss,
    Weather,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::HeartbeatLoss => write!(f, "heartbeat loss"),
            ShutdownCause::Weather => write!(f, "weather"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShutdownStage {
    #[default]
    Idle,
    AwaitingPeerConnection,
    ParkingMount,
    ParkingDome,
    RunningScript,
    Complete,
    Error,
}

impl ShutdownStage {
    /// A sequence is running and must not be disturbed by config changes.
    pub fn in_progress(self) -> bool {
        matches!(
            self,
            ShutdownStage::AwaitingPeerConnection
                | ShutdownStage::ParkingMount
                | ShutdownStage::ParkingDome
                | ShutdownStage::RunningScript
        )
    }
}

impl fmt::Display for ShutdownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownStage::Idle => "idle",
            ShutdownStage::AwaitingPeerConnection => "awaiting peer connection",
            ShutdownStage::ParkingMount => "parking mount",
            ShutdownStage::ParkingDome => "parking dome",
            ShutdownStage::RunningScript => "running script",
            ShutdownStage::Complete => "complete",
            ShutdownStage::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Complete,
    Error { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRecord {
    pub cause: ShutdownCause,
    pub started_ms: u64,
    pub finished_ms: Option<u64>,
    pub outcome: Option<AttemptOutcome>,
    pub script_exit_code: Option<i32>,
}

#[derive(Debug)]
pub struct ShutdownOrchestrator {
    stage: ShutdownStage,
    cause: Option<ShutdownCause>,
    /// Mount park issued alongside the dome under `MountPolicy::Ignored`
    /// and not yet observed parked.
    mount_outstanding: bool,
    indicator: PropertyState,
    message: String,
    last_exit_code: Option<i32>,
    history: Vec<ShutdownRecord, MAX_SHUTDOWN_HISTORY>,
}

impl Default for ShutdownOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownOrchestrator {
    pub fn new() -> Self {
        Self {
            stage: ShutdownStage::Idle,
            cause: None,
            mount_outstanding: false,
            indicator: PropertyState::Idle,
            message: String::new(),
            last_exit_code: None,
            history: Vec::new(),
        }
    }

    /// Advance the state machine by one poll.
    ///
    /// `trigger` starts a sequence only from `Idle` or `Complete`; anywhere
    /// else it is ignored, so concurrent triggers never double-enter.
    pub fn tick<B, R>(
        &mut self,
        now_ms: u64,
        trigger: Option<ShutdownCause>,
        config: &WatchdogConfig,
        bus: &mut B,
        runner: &mut R,
    ) -> ShutdownStage
    where
        B: PropertyBus,
        R: ScriptRunner,
    {
        if let Some(cause) = trigger {
            self.on_trigger(now_ms, cause, config, bus);
        }

        match self.stage {
            ShutdownStage::Idle | ShutdownStage::RunningScript | ShutdownStage::Error => {}
            ShutdownStage::AwaitingPeerConnection => {
                self.poll_connection(now_ms, config, bus, runner);
            }
            ShutdownStage::ParkingMount => self.poll_mount(now_ms, config, bus, runner),
            ShutdownStage::ParkingDome => self.poll_dome(now_ms, config, bus, runner),
            ShutdownStage::Complete => {
                if !bus.is_connected() {
                    debug!("Property server connection closed, watchdog returns to idle");
                    self.stage = ShutdownStage::Idle;
                }
            }
        }

        self.stage
    }

    /// Return to `Idle`. In-flight park commands are not recalled.
    pub fn reset(&mut self) {
        self.stage = ShutdownStage::Idle;
        self.cause = None;
        self.mount_outstanding = false;
        self.indicator = PropertyState::Idle;
        self.message.clear();
    }

    pub fn stage(&self) -> ShutdownStage {
        self.stage
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        self.cause
    }

    pub fn in_progress(&self) -> bool {
        self.stage.in_progress()
    }

    /// State indicator and message for the shutdown-steps property.
    pub fn indicator(&self) -> (PropertyState, &str) {
        (self.indicator, &self.message)
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    pub fn history(&self) -> &[ShutdownRecord] {
        &self.history
    }

    fn on_trigger<B: PropertyBus>(
        &mut self,
        now_ms: u64,
        cause: ShutdownCause,
        config: &WatchdogConfig,
        bus: &mut B,
    ) {
        match self.stage {
            ShutdownStage::Idle | ShutdownStage::Complete => {}
            stage => {
                debug!("Shutdown {}; ignoring {} trigger", stage, cause);
                return;
            }
        }

        if config.steps.is_empty() {
            debug!("No shutdown step selected; ignoring {} trigger", cause);
            return;
        }

        match cause {
            ShutdownCause::Weather => {
                warn!("Warning! Weather status in DANGER zone, executing shutdown procedure...");
            }
            ShutdownCause::HeartbeatLoss => {
                warn!("Warning! Heartbeat threshold timed out, executing shutdown procedure...");
            }
        }

        self.cause = Some(cause);
        self.mount_outstanding = false;
        self.last_exit_code = None;
        self.record_start(now_ms, cause);
        self.set_indicator(PropertyState::Busy, "Executing shutdown procedure...");

        if config.steps.needs_bus() && !bus.is_connected() {
            debug!("Connecting to property server {}...", config.server.address());
            if let Err(e) = bus.connect(&config.server) {
                self.fail(
                    now_ms,
                    format!(
                        "Error: Unable to connect to property server {}: {}. Shutdown procedure terminated.",
                        config.server.address(),
                        e
                    ),
                );
                return;
            }
        }

        self.stage = ShutdownStage::AwaitingPeerConnection;
    }

    fn poll_connection<B, R>(&mut self, now_ms: u64, config: &WatchdogConfig, bus: &mut B, runner: &mut R)
    where
        B: PropertyBus,
        R: ScriptRunner,
    {
        if config.steps.needs_bus() {
            if !bus.is_connected() {
                debug!("Waiting for property server connection...");
                return;
            }
            debug!("Connected to property server {}", config.server.address());
        }

        if config.steps.park_mount {
            self.start_mount(now_ms, config, bus);
        } else if config.steps.park_dome {
            self.start_dome(now_ms, config, bus);
        } else if config.steps.run_script {
            self.start_script(now_ms, config, runner);
        } else {
            self.complete(now_ms);
        }
    }

    fn poll_mount<B, R>(&mut self, now_ms: u64, config: &WatchdogConfig, bus: &mut B, runner: &mut R)
    where
        B: PropertyBus,
        R: ScriptRunner,
    {
        match bus.park_state(&config.peers.telescope, ParkTarget::Mount) {
            ParkState::Parked => {
                info!("Mount parked.");
                if config.steps.park_dome {
                    self.start_dome(now_ms, config, bus);
                } else if config.steps.run_script {
                    self.start_script(now_ms, config, runner);
                } else {
                    self.complete(now_ms);
                }
            }
            state => debug!("Mount park state {:?}, waiting", state),
        }
    }

    fn poll_dome<B, R>(&mut self, now_ms: u64, config: &WatchdogConfig, bus: &mut B, runner: &mut R)
    where
        B: PropertyBus,
        R: ScriptRunner,
    {
        if self.mount_outstanding
            && bus.park_state(&config.peers.telescope, ParkTarget::Mount) == ParkState::Parked
        {
            info!("Mount parked.");
            self.mount_outstanding = false;
        }

        let dome = bus.park_state(&config.peers.dome, ParkTarget::Dome);
        if dome != ParkState::Parked || self.mount_outstanding {
            debug!(
                "Dome park state {:?}, mount outstanding: {}, waiting",
                dome, self.mount_outstanding
            );
            return;
        }

        info!("Dome parked.");
        if config.steps.run_script {
            self.start_script(now_ms, config, runner);
        } else {
            self.complete(now_ms);
        }
    }

    fn start_mount<B: PropertyBus>(&mut self, now_ms: u64, config: &WatchdogConfig, bus: &mut B) {
        if let Err(e) = bus.park(&config.peers.telescope, ParkTarget::Mount) {
            self.fail(
                now_ms,
                format!("Error: Unable to park mount! ({e}) Shutdown procedure terminated."),
            );
            return;
        }
        info!("Parking mount...");
        self.set_indicator(PropertyState::Busy, "Parking mount...");

        if config.mount_policy == MountPolicy::Ignored && config.steps.park_dome {
            self.mount_outstanding = true;
            self.start_dome(now_ms, config, bus);
        } else {
            self.stage = ShutdownStage::ParkingMount;
        }
    }

    fn start_dome<B: PropertyBus>(&mut self, now_ms: u64, config: &WatchdogConfig, bus: &mut B) {
        if let Err(e) = bus.park(&config.peers.dome, ParkTarget::Dome) {
            self.fail(
                now_ms,
                format!("Error: Unable to park dome! ({e}) Shutdown procedure terminated."),
            );
            return;
        }
        info!("Parking dome...");
        self.set_indicator(PropertyState::Busy, "Parking dome...");
        self.stage = ShutdownStage::ParkingDome;
    }

    /// Blocks the tick until the script exits.
    fn start_script<R: ScriptRunner>(&mut self, now_ms: u64, config: &WatchdogConfig, runner: &mut R) {
        let Some(path) = config.script_path.as_deref().filter(|p| !p.as_os_str().is_empty()) else {
            self.fail(
                now_ms,
                "Error: shutdown script file is not set. Shutdown procedure terminated.".to_string(),
            );
            return;
        };

        self.stage = ShutdownStage::RunningScript;
        self.set_indicator(PropertyState::Busy, "Executing shutdown script...");
        info!("Executing script {}...", path.display());

        match runner.run(path) {
            Ok(ScriptOutcome::Exited(code)) => {
                info!("Script complete with exit code {}", code);
                self.last_exit_code = Some(code);
                self.record_exit_code(code);
                if code == 0 {
                    self.complete(now_ms);
                } else {
                    self.fail(
                        now_ms,
                        format!(
                            "Error: script {} failed with exit code {}. Shutdown procedure terminated.",
                            path.display(),
                            code
                        ),
                    );
                }
            }
            Ok(ScriptOutcome::Abnormal) => self.fail(
                now_ms,
                format!(
                    "Error: script {} did not terminate with exit. Shutdown procedure terminated.",
                    path.display()
                ),
            ),
            Err(e) => self.fail(now_ms, format!("Error: {e}. Shutdown procedure terminated.")),
        }
    }

    fn complete(&mut self, now_ms: u64) {
        info!("Shutdown procedure complete.");
        self.stage = ShutdownStage::Complete;
        self.mount_outstanding = false;
        self.set_indicator(PropertyState::Ok, "Shutdown procedure complete.");
        self.record_finish(now_ms, AttemptOutcome::Complete);
    }

    fn fail(&mut self, now_ms: u64, reason: String) {
        error!("{}", reason);
        self.stage = ShutdownStage::Error;
        self.mount_outstanding = false;
        self.set_indicator(PropertyState::Alert, &reason);
        self.record_finish(now_ms, AttemptOutcome::Error { reason });
    }

    fn set_indicator(&mut self, state: PropertyState, message: &str) {
        self.indicator = state;
        self.message.clear();
        self.message.push_str(message);
    }

    fn record_start(&mut self, now_ms: u64, cause: ShutdownCause) {
        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(ShutdownRecord {
            cause,
            started_ms: now_ms,
            finished_ms: None,
            outcome: None,
            script_exit_code: None,
        });
    }

    fn record_exit_code(&mut self, code: i32) {
        if let Some(record) = self.history.last_mut() {
            record.script_exit_code = Some(code);
        }
    }

    fn record_finish(&mut self, now_ms: u64, outcome: AttemptOutcome) {
        if let Some(record) = self.history.last_mut() {
            record.finished_ms = Some(now_ms);
            record.outcome = Some(outcome);
        }
    }
}
