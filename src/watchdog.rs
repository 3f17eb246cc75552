use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::bus::{
    ParkReport, ParkTarget, PeerEvent, PropertyBus, PropertyState, DOME_PARK, TELESCOPE_PARK,
    WEATHER_STATUS,
};
use crate::config::{
    MountPolicy, PeerNames, ServerSettings, ShutdownSteps, ShutdownTriggers, WatchdogConfig,
};
use crate::error::{ConfigError, WatchdogError};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatStatus};
use crate::protocol::{
    Command, CommandResponse, CommandType, PropertyBoard, PropertyName, ProtocolHandler,
    ResponseStatus, StatusReport,
};
use crate::rearm::ReArmGuard;
use crate::script::{ScriptRunner, SystemScriptRunner};
use crate::shutdown::{ShutdownCause, ShutdownOrchestrator, ShutdownStage};
use crate::weather::{WeatherMonitor, WeatherState};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchdogState {
    pub connected: bool,
    pub uptime_seconds: u64,
    pub command_count: u32,
    pub last_error: Option<String>,
}

/// The watchdog device: owns configuration, both monitors, the orchestrator
/// and the re-arm guard, and routes operator commands and peer events to them.
pub struct Watchdog<B: PropertyBus, R: ScriptRunner = SystemScriptRunner> {
    config: WatchdogConfig,
    heartbeat: HeartbeatMonitor,
    weather: WeatherMonitor,
    orchestrator: ShutdownOrchestrator,
    rearm: ReArmGuard,
    board: PropertyBoard,
    protocol_handler: ProtocolHandler,
    bus: B,
    runner: R,
    state: WatchdogState,
    pending_trigger: Option<ShutdownCause>,
}

impl<B: PropertyBus> Watchdog<B, SystemScriptRunner> {
    pub fn new(config: WatchdogConfig, bus: B) -> Self {
        Self::with_runner(config, bus, SystemScriptRunner)
    }
}

impl<B: PropertyBus, R: ScriptRunner> Watchdog<B, R> {
    pub fn with_runner(config: WatchdogConfig, bus: B, runner: R) -> Self {
        Self {
            config,
            heartbeat: HeartbeatMonitor::new(),
            weather: WeatherMonitor::new(),
            orchestrator: ShutdownOrchestrator::new(),
            rearm: ReArmGuard::new(),
            board: PropertyBoard::new(),
            protocol_handler: ProtocolHandler::new(),
            bus,
            runner,
            state: WatchdogState::default(),
            pending_trigger: None,
        }
    }

    /// Activate the watchdog: arm the client countdown if selected and snoop
    /// the peer devices. Also clears a terminal `Error` stage.
    pub fn connect(&mut self, now_ms: u64) -> Result<(), WatchdogError> {
        if self.state.connected {
            return Ok(());
        }

        self.snoop_peers()?;

        if self.orchestrator.stage() == ShutdownStage::Error {
            info!("Clearing previous shutdown error");
            self.orchestrator.reset();
        }

        if self.config.triggers.client_heartbeat {
            self.heartbeat
                .on_trigger_enabled(now_ms, self.config.heartbeat_timeout_seconds);
        }

        if self.config.triggers.weather {
            if self.config.weather_grace_seconds > 0 {
                info!(
                    "Weather Watchdog is enabled. Shutdown is triggered {} seconds after Weather status enters DANGER zone.",
                    self.config.weather_grace_seconds
                );
            } else {
                info!("Weather Watchdog is enabled. Shutdown is triggered when Weather status in DANGER zone.");
            }
        }

        self.state.connected = true;
        Ok(())
    }

    /// Cancel both countdowns and return the orchestrator to `Idle`.
    pub fn disconnect(&mut self) {
        self.heartbeat.on_trigger_disabled();
        self.weather.disarm();
        self.orchestrator.reset();
        self.pending_trigger = None;
        self.state.connected = false;
        self.board
            .set(PropertyName::ShutdownSteps, PropertyState::Idle, "");
        info!("Watchdog is disabled.");
    }

    /// One poll of the event loop. Returns a fresh status when the shutdown
    /// stage changed or a trigger was raised.
    pub fn update(&mut self, now_ms: u64) -> Option<StatusReport> {
        if !self.state.connected {
            return None;
        }
        self.state.uptime_seconds = now_ms / 1000;

        if let Some(cause) = self.heartbeat.poll(now_ms, &self.config.steps) {
            self.raise_trigger(cause);
        }
        if let Some(cause) = self.weather.poll(now_ms) {
            self.raise_trigger(cause);
        }

        let before = self.orchestrator.stage();
        let trigger = self.pending_trigger.take();
        let stage = self.orchestrator.tick(
            now_ms,
            trigger,
            &self.config,
            &mut self.bus,
            &mut self.runner,
        );

        if stage == before && trigger.is_none() {
            return None;
        }

        let (indicator, message) = self.orchestrator.indicator();
        let message = message.to_string();
        if stage == ShutdownStage::Error {
            self.state.last_error = Some(message.clone());
        }
        self.board
            .set(PropertyName::ShutdownSteps, indicator, message);
        Some(self.status(now_ms))
    }

    pub fn handle_peer_event(&mut self, event: PeerEvent, now_ms: u64) {
        if !self.state.connected {
            return;
        }

        match event {
            PeerEvent::Weather { device, state } => {
                if device != self.config.peers.weather {
                    debug!("Ignoring weather status from {}", device);
                    return;
                }
                if let Some(cause) = self.weather.on_hazard_update(
                    now_ms,
                    state,
                    self.config.triggers.weather,
                    self.config.weather_grace_seconds,
                ) {
                    self.raise_trigger(cause);
                }
            }
            PeerEvent::Park { target, report } => self.observe_park(target, &report),
        }
    }

    pub fn handle_command(&mut self, command: Command, now_ms: u64) -> CommandResponse {
        self.state.command_count = self.state.command_count.saturating_add(1);

        if let Err(e) = self.protocol_handler.validate_command(&command) {
            return self.protocol_handler.create_error_response(
                command.id,
                &format!("Command validation failed: {e}"),
            );
        }

        let id = command.id;
        let result = match command.command_type {
            CommandType::Ping => Ok("pong".to_string()),
            CommandType::Status => self
                .protocol_handler
                .serialize_status(&self.status(now_ms))
                .map_err(WatchdogError::from),
            CommandType::Connect => self
                .connect(now_ms)
                .map(|()| "Watchdog connected".to_string()),
            CommandType::Disconnect => {
                self.disconnect();
                Ok("Watchdog disconnected".to_string())
            }
            CommandType::Heartbeat { interval_seconds } => {
                self.write_heartbeat(now_ms, interval_seconds)
            }
            CommandType::SetWeatherThreshold { seconds } => {
                self.config.set_weather_grace(seconds);
                Ok(self.accept(
                    PropertyName::WeatherThreshold,
                    format!("Weather threshold set to {seconds} seconds"),
                ))
            }
            CommandType::SetShutdownSteps { steps } => {
                self.write_steps(ShutdownSteps::from_steps(&steps))
            }
            CommandType::SetShutdownTriggers { triggers } => {
                self.write_triggers(now_ms, ShutdownTriggers::from_triggers(&triggers))
            }
            CommandType::SetMountPolicy { policy } => {
                self.config.set_mount_policy(policy);
                let message = match policy {
                    MountPolicy::Ignored => "Mount is ignored. Dome can start parking without waiting for mount to complete parking.",
                    MountPolicy::Locks => "Mount locks. Dome must wait for mount to park before it can start the parking procedure.",
                };
                info!("{}", message);
                Ok(self.accept(PropertyName::MountPolicy, message))
            }
            CommandType::SetActiveDevices {
                telescope,
                dome,
                weather,
            } => self.write_peers(telescope, dome, weather),
            CommandType::SetScriptPath { path } => {
                let path = (!path.trim().is_empty()).then(|| PathBuf::from(path));
                match self.config.set_script_path(path) {
                    Ok(()) => Ok(self.accept(PropertyName::ScriptPath, "Script path updated")),
                    Err(e) => Err(self.reject(PropertyName::ScriptPath, e)),
                }
            }
            CommandType::SetServer { host, port } => self.write_server(ServerSettings { host, port }),
        };

        match result {
            Ok(message) => self.protocol_handler.create_response(
                id,
                ResponseStatus::Success,
                Some(&message),
            ),
            Err(WatchdogError::Config(e)) => {
                self.protocol_handler.create_rejected_response(id, &e.to_string())
            }
            Err(e) => {
                self.state.last_error = Some(e.to_string());
                self.protocol_handler.create_error_response(id, &e.to_string())
            }
        }
    }

    pub fn status(&self, now_ms: u64) -> StatusReport {
        StatusReport {
            timestamp_ms: now_ms,
            connected: self.state.connected,
            bus_connected: self.bus.is_connected(),
            stage: self.orchestrator.stage(),
            cause: self.orchestrator.cause(),
            weather: self.weather.state(),
            heartbeat_remaining_ms: self.heartbeat.remaining_ms(now_ms),
            weather_grace_remaining_ms: self.weather.grace_remaining_ms(now_ms),
            last_exit_code: self.orchestrator.last_exit_code(),
            reissued_parks: self.rearm.reissued(),
            properties: self.board.report(),
            history: self.orchestrator.history().to_vec(),
            config: self.config.clone(),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn state(&self) -> &WatchdogState {
        &self.state
    }

    pub fn stage(&self) -> ShutdownStage {
        self.orchestrator.stage()
    }

    pub fn weather_state(&self) -> WeatherState {
        self.weather.state()
    }

    pub fn orchestrator(&self) -> &ShutdownOrchestrator {
        &self.orchestrator
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn property(&self, name: PropertyName) -> &crate::protocol::PropertyStatus {
        self.board.get(name)
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn runner_mut(&mut self) -> &mut R {
        &mut self.runner
    }

    fn raise_trigger(&mut self, cause: ShutdownCause) {
        if self.config.steps.is_empty() {
            debug!("Dropping {} trigger: no shutdown step selected", cause);
            return;
        }
        if self.pending_trigger.is_none() {
            self.pending_trigger = Some(cause);
        }
    }

    fn observe_park(&mut self, target: ParkTarget, report: &ParkReport) {
        let expected = match target {
            ParkTarget::Mount => &self.config.peers.telescope,
            ParkTarget::Dome => &self.config.peers.dome,
        };
        if &report.device != expected {
            debug!("Ignoring {} park report from {}", target, report.device);
            return;
        }
        self.rearm.observe(
            target,
            report,
            self.weather.state(),
            &self.config,
            &mut self.bus,
        );
    }

    fn snoop_peers(&mut self) -> Result<(), WatchdogError> {
        let peers = self.config.peers.clone();
        self.bus.snoop(&peers.weather, WEATHER_STATUS)?;
        self.bus.snoop(&peers.telescope, TELESCOPE_PARK)?;
        self.bus.snoop(&peers.dome, DOME_PARK)?;
        Ok(())
    }

    fn write_heartbeat(&mut self, now_ms: u64, interval_seconds: u32) -> Result<String, WatchdogError> {
        if self.orchestrator.in_progress() {
            return Err(self.reject(
                PropertyName::HeartbeatThreshold,
                ConfigError::ShutdownInProgress {
                    property: "heart beat",
                },
            ));
        }

        self.config.set_heartbeat_timeout(interval_seconds);
        if !self.state.connected {
            return Ok(self.accept(
                PropertyName::HeartbeatThreshold,
                format!("Heart beat threshold set to {interval_seconds} seconds"),
            ));
        }

        let status = self.heartbeat.on_heartbeat_received(
            now_ms,
            interval_seconds,
            self.config.triggers.client_heartbeat,
        );
        let message = match status {
            HeartbeatStatus::Armed { seconds } => format!("Heart beat received, next expected within {seconds} seconds"),
            HeartbeatStatus::Disabled => "Client Watchdog is disabled.".to_string(),
            HeartbeatStatus::TriggerOff => "Heart beat recorded; client trigger is off".to_string(),
        };
        Ok(self.accept(PropertyName::HeartbeatThreshold, message))
    }

    fn write_steps(&mut self, steps: ShutdownSteps) -> Result<String, WatchdogError> {
        match self.config.set_steps(steps) {
            Ok(()) => {
                let names: Vec<String> = steps.ordered().iter().map(ToString::to_string).collect();
                let message = if names.is_empty() {
                    "No shutdown step selected".to_string()
                } else {
                    format!("Shutdown steps: {}", names.join(", "))
                };
                Ok(self.accept(PropertyName::ShutdownSteps, message))
            }
            Err(e) => {
                error!("Error: {}.", e);
                Err(self.reject(PropertyName::ShutdownSteps, e))
            }
        }
    }

    fn write_triggers(&mut self, now_ms: u64, triggers: ShutdownTriggers) -> Result<String, WatchdogError> {
        let previous = self.config.triggers;
        if let Err(e) = self.config.set_triggers(triggers) {
            error!("{}.", e);
            return Err(self.reject(PropertyName::ShutdownTriggers, e));
        }

        if previous.client_heartbeat != triggers.client_heartbeat {
            if triggers.client_heartbeat {
                if self.state.connected {
                    self.heartbeat
                        .on_trigger_enabled(now_ms, self.config.heartbeat_timeout_seconds);
                }
            } else {
                info!("Disabling client watchdog. Lost communication with client shall not trigger the shutdown procedure.");
                self.heartbeat.on_trigger_disabled();
            }
        }

        if previous.weather != triggers.weather {
            if triggers.weather {
                info!("Weather Watchdog is enabled.");
            } else {
                self.weather.on_trigger_disabled();
            }
        }

        Ok(self.accept(PropertyName::ShutdownTriggers, "Shutdown triggers updated"))
    }

    fn write_peers(
        &mut self,
        telescope: Option<String>,
        dome: Option<String>,
        weather: Option<String>,
    ) -> Result<String, WatchdogError> {
        if self.orchestrator.in_progress() {
            error!("Cannot change devices names while shutdown is in progress...");
            return Err(self.reject(
                PropertyName::ActiveDevices,
                ConfigError::ShutdownInProgress {
                    property: "active devices",
                },
            ));
        }

        let current = &self.config.peers;
        let peers = PeerNames {
            telescope: telescope.unwrap_or_else(|| current.telescope.clone()),
            dome: dome.unwrap_or_else(|| current.dome.clone()),
            weather: weather.unwrap_or_else(|| current.weather.clone()),
        };
        if let Err(e) = self.config.set_peers(peers) {
            return Err(self.reject(PropertyName::ActiveDevices, e));
        }

        self.rearm.clear();
        if self.state.connected {
            self.snoop_peers()?;
        }
        Ok(self.accept(PropertyName::ActiveDevices, "Active devices updated"))
    }

    fn write_server(&mut self, server: ServerSettings) -> Result<String, WatchdogError> {
        if self.orchestrator.in_progress() {
            return Err(self.reject(
                PropertyName::ServerSettings,
                ConfigError::ShutdownInProgress {
                    property: "server settings",
                },
            ));
        }
        match self.config.set_server(server) {
            Ok(()) => {
                let message = format!("Property server set to {}", self.config.server.address());
                Ok(self.accept(PropertyName::ServerSettings, message))
            }
            Err(e) => {
                error!("Failed to parse server settings: {}", e);
                Err(self.reject(PropertyName::ServerSettings, e))
            }
        }
    }

    fn accept(&mut self, name: PropertyName, message: impl Into<String>) -> String {
        let message = message.into();
        self.board.set(name, PropertyState::Ok, message.clone());
        message
    }

    fn reject(&mut self, name: PropertyName, error: ConfigError) -> WatchdogError {
        self.board.set(name, PropertyState::Alert, error.to_string());
        WatchdogError::Config(error)
    }
}
