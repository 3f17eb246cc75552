use serde::{Deserialize, Serialize};

use crate::bus::PropertyState;
use crate::config::{MountPolicy, ShutdownStep, ShutdownTrigger, WatchdogConfig};
use crate::error::ProtocolError;
use crate::shutdown::{ShutdownCause, ShutdownRecord, ShutdownStage};
use crate::weather::WeatherState;

pub const MAX_COMMAND_SIZE: usize = 1024;
pub const MAX_THRESHOLD_SECONDS: u32 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub timestamp: u64,
    pub command_type: CommandType,
}

/// Operator writes, decoded once at the control boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    Ping,
    Status,
    Connect,
    Disconnect,
    /// Heartbeat threshold write; doubles as the client liveness signal.
    Heartbeat { interval_seconds: u32 },
    SetWeatherThreshold { seconds: u32 },
    SetShutdownSteps { steps: Vec<ShutdownStep> },
    SetShutdownTriggers { triggers: Vec<ShutdownTrigger> },
    SetMountPolicy { policy: MountPolicy },
    SetActiveDevices {
        telescope: Option<String>,
        dome: Option<String>,
        weather: Option<String>,
    },
    SetScriptPath { path: String },
    SetServer { host: String, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub timestamp: u64,
    pub status: ResponseStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    /// Write refused; the property is in alert and keeps its old value.
    Rejected,
    Error,
}

/// Operator-visible properties of the watchdog device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyName {
    HeartbeatThreshold,
    WeatherThreshold,
    ShutdownSteps,
    ShutdownTriggers,
    MountPolicy,
    ActiveDevices,
    ScriptPath,
    ServerSettings,
}

impl PropertyName {
    pub const ALL: [PropertyName; 8] = [
        PropertyName::HeartbeatThreshold,
        PropertyName::WeatherThreshold,
        PropertyName::ShutdownSteps,
        PropertyName::ShutdownTriggers,
        PropertyName::MountPolicy,
        PropertyName::ActiveDevices,
        PropertyName::ScriptPath,
        PropertyName::ServerSettings,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            PropertyName::HeartbeatThreshold => "heart beat",
            PropertyName::WeatherThreshold => "weather threshold",
            PropertyName::ShutdownSteps => "shutdown steps",
            PropertyName::ShutdownTriggers => "shutdown triggers",
            PropertyName::MountPolicy => "mount policy",
            PropertyName::ActiveDevices => "active devices",
            PropertyName::ScriptPath => "script path",
            PropertyName::ServerSettings => "server settings",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertyStatus {
    pub state: PropertyState,
    pub message: String,
}

/// State indicator plus last message for every operator property.
#[derive(Debug, Clone, Default)]
pub struct PropertyBoard {
    entries: [PropertyStatus; 8],
}

impl PropertyBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: PropertyName, state: PropertyState, message: impl Into<String>) {
        let entry = &mut self.entries[name.index()];
        entry.state = state;
        entry.message = message.into();
    }

    pub fn get(&self, name: PropertyName) -> &PropertyStatus {
        &self.entries[name.index()]
    }

    pub fn report(&self) -> Vec<PropertyReport> {
        PropertyName::ALL
            .iter()
            .map(|name| PropertyReport {
                name: *name,
                state: self.get(*name).state,
                message: self.get(*name).message.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyReport {
    pub name: PropertyName,
    pub state: PropertyState,
    pub message: String,
}

/// Snapshot returned by `Status` and broadcast on stage changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub timestamp_ms: u64,
    pub connected: bool,
    pub bus_connected: bool,
    pub stage: ShutdownStage,
    pub cause: Option<ShutdownCause>,
    pub weather: WeatherState,
    pub heartbeat_remaining_ms: Option<u64>,
    pub weather_grace_remaining_ms: Option<u64>,
    pub last_exit_code: Option<i32>,
    pub reissued_parks: u32,
    pub properties: Vec<PropertyReport>,
    pub history: Vec<ShutdownRecord>,
    pub config: WatchdogConfig,
}

#[derive(Debug, Default)]
pub struct ProtocolHandler {
    start: Option<std::time::Instant>,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            start: Some(std::time::Instant::now()),
        }
    }

    pub fn parse_command(&self, json_str: &str) -> Result<Command, ProtocolError> {
        if json_str.len() > MAX_COMMAND_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        serde_json::from_str::<Command>(json_str).map_err(|_| ProtocolError::InvalidJson)
    }

    pub fn serialize_response(&self, response: &CommandResponse) -> Result<String, ProtocolError> {
        serde_json::to_string(response).map_err(|_| ProtocolError::SerializationError)
    }

    pub fn serialize_status(&self, report: &StatusReport) -> Result<String, ProtocolError> {
        serde_json::to_string(report).map_err(|_| ProtocolError::SerializationError)
    }

    pub fn create_response(
        &self,
        command_id: u32,
        status: ResponseStatus,
        message: Option<&str>,
    ) -> CommandResponse {
        CommandResponse {
            id: command_id,
            timestamp: self.get_timestamp(),
            status,
            message: message.map(ToString::to_string),
        }
    }

    pub fn create_rejected_response(&self, command_id: u32, reason: &str) -> CommandResponse {
        self.create_response(command_id, ResponseStatus::Rejected, Some(reason))
    }

    pub fn create_error_response(&self, command_id: u32, reason: &str) -> CommandResponse {
        self.create_response(command_id, ResponseStatus::Error, Some(reason))
    }

    pub fn validate_command(&self, command: &Command) -> Result<(), ProtocolError> {
        if command.id == 0 {
            return Err(ProtocolError::InvalidCommand);
        }

        match &command.command_type {
            CommandType::Heartbeat { interval_seconds: seconds }
            | CommandType::SetWeatherThreshold { seconds } => {
                if *seconds > MAX_THRESHOLD_SECONDS {
                    return Err(ProtocolError::InvalidParameter);
                }
            }
            CommandType::SetActiveDevices {
                telescope,
                dome,
                weather,
            } => {
                if telescope.is_none() && dome.is_none() && weather.is_none() {
                    return Err(ProtocolError::InvalidParameter);
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn get_timestamp(&self) -> u64 {
        self.start
            .map_or(0, |start| start.elapsed().as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_tracks_each_property() {
        let mut board = PropertyBoard::new();
        board.set(PropertyName::ScriptPath, PropertyState::Alert, "not set");
        assert_eq!(board.get(PropertyName::ScriptPath).state, PropertyState::Alert);
        assert_eq!(board.get(PropertyName::MountPolicy).state, PropertyState::Idle);
        assert_eq!(board.report().len(), PropertyName::ALL.len());
    }
}
