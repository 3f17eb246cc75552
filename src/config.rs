//! Watchdog configuration.
//!
//! A single [`WatchdogConfig`] is loaded at startup (optionally from a TOML
//! file) and then mutated at runtime through operator property writes. Every
//! setter validates before assigning, so a rejected write leaves the previous
//! configuration untouched.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, WatchdogError};

pub const DEFAULT_SERVER_HOST: &str = "localhost";
pub const DEFAULT_SERVER_PORT: u16 = 7624;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShutdownStep {
    ParkMount,
    ParkDome,
    RunScript,
}

impl fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownStep::ParkMount => write!(f, "park mount"),
            ShutdownStep::ParkDome => write!(f, "park dome"),
            ShutdownStep::RunScript => write!(f, "run script"),
        }
    }
}

/// Enabled shutdown steps. Execution order is fixed: mount, dome, script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSteps {
    pub park_mount: bool,
    pub park_dome: bool,
    pub run_script: bool,
}

impl ShutdownSteps {
    pub fn from_steps(steps: &[ShutdownStep]) -> Self {
        let mut set = Self::default();
        for step in steps {
            match step {
                ShutdownStep::ParkMount => set.park_mount = true,
                ShutdownStep::ParkDome => set.park_dome = true,
                ShutdownStep::RunScript => set.run_script = true,
            }
        }
        set
    }

    pub fn contains(&self, step: ShutdownStep) -> bool {
        match step {
            ShutdownStep::ParkMount => self.park_mount,
            ShutdownStep::ParkDome => self.park_dome,
            ShutdownStep::RunScript => self.run_script,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.park_mount || self.park_dome || self.run_script)
    }

    /// True when at least one step needs the property bus.
    pub fn needs_bus(&self) -> bool {
        self.park_mount || self.park_dome
    }

    /// Enabled steps in execution order.
    pub fn ordered(&self) -> Vec<ShutdownStep> {
        [
            ShutdownStep::ParkMount,
            ShutdownStep::ParkDome,
            ShutdownStep::RunScript,
        ]
        .into_iter()
        .filter(|step| self.contains(*step))
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShutdownTrigger {
    ClientHeartbeat,
    Weather,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownTriggers {
    pub client_heartbeat: bool,
    pub weather: bool,
}

impl ShutdownTriggers {
    pub fn from_triggers(triggers: &[ShutdownTrigger]) -> Self {
        let mut set = Self::default();
        for trigger in triggers {
            match trigger {
                ShutdownTrigger::ClientHeartbeat => set.client_heartbeat = true,
                ShutdownTrigger::Weather => set.weather = true,
            }
        }
        set
    }
}

/// Whether dome parking has to wait for the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MountPolicy {
    /// Dome starts parking without waiting for the mount.
    #[default]
    Ignored,
    /// Dome waits until the mount reports parked.
    Locks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerNames {
    pub telescope: String,
    pub dome: String,
    pub weather: String,
}

impl Default for PeerNames {
    fn default() -> Self {
        Self {
            telescope: "Telescope Simulator".to_string(),
            dome: "Dome Simulator".to_string(),
            weather: "Weather Simulator".to_string(),
        }
    }
}

impl PeerNames {
    fn validate(&self) -> Result<(), ConfigError> {
        for (role, name) in [
            ("telescope", &self.telescope),
            ("dome", &self.dome),
            ("weather", &self.weather),
        ] {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyDeviceName { role });
            }
        }
        Ok(())
    }
}

/// Where the property server lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

impl ServerSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() || self.port == 0 {
            return Err(ConfigError::InvalidServer {
                host: self.host.clone(),
                port: self.port,
            });
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Client heartbeat window; 0 disables the client watchdog.
    pub heartbeat_timeout_seconds: u32,
    /// Grace period after weather enters hazard; 0 acts immediately.
    pub weather_grace_seconds: u32,
    pub steps: ShutdownSteps,
    pub triggers: ShutdownTriggers,
    pub mount_policy: MountPolicy,
    pub script_path: Option<PathBuf>,
    pub peers: PeerNames,
    pub server: ServerSettings,
    pub poll_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 0,
            weather_grace_seconds: 0,
            steps: ShutdownSteps::default(),
            triggers: ShutdownTriggers::default(),
            mount_policy: MountPolicy::default(),
            script_path: None,
            peers: PeerNames::default(),
            server: ServerSettings::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl WatchdogConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, WatchdogError> {
        let contents = std::fs::read_to_string(path).map_err(|source| WatchdogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|e| match e {
            WatchdogError::ConfigParse { details, .. } => WatchdogError::ConfigParse {
                path: path.to_path_buf(),
                details,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, WatchdogError> {
        let config: Self = toml::from_str(contents).map_err(|e| WatchdogError::ConfigParse {
            path: PathBuf::new(),
            details: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every cross-field rule. Used on load; runtime setters apply the
    /// subset relevant to the field they change.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.triggers.client_heartbeat && self.heartbeat_timeout_seconds == 0 {
            return Err(ConfigError::HeartbeatThresholdRequired);
        }
        if self.steps.run_script && !self.has_script() {
            return Err(ConfigError::ScriptPathRequired);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        self.peers.validate()?;
        self.server.validate()
    }

    pub fn has_script(&self) -> bool {
        self.script_path
            .as_ref()
            .is_some_and(|path| !path.as_os_str().is_empty())
    }

    /// A zero threshold is accepted here: it disables the client watchdog
    /// rather than violating the trigger rule.
    pub fn set_heartbeat_timeout(&mut self, seconds: u32) {
        self.heartbeat_timeout_seconds = seconds;
    }

    pub fn set_weather_grace(&mut self, seconds: u32) {
        self.weather_grace_seconds = seconds;
    }

    pub fn set_steps(&mut self, steps: ShutdownSteps) -> Result<(), ConfigError> {
        if steps.run_script && !self.has_script() {
            return Err(ConfigError::ScriptPathRequired);
        }
        self.steps = steps;
        Ok(())
    }

    pub fn set_triggers(&mut self, triggers: ShutdownTriggers) -> Result<(), ConfigError> {
        if triggers.client_heartbeat && self.heartbeat_timeout_seconds == 0 {
            return Err(ConfigError::HeartbeatThresholdRequired);
        }
        self.triggers = triggers;
        Ok(())
    }

    pub fn set_mount_policy(&mut self, policy: MountPolicy) {
        self.mount_policy = policy;
    }

    pub fn set_peers(&mut self, peers: PeerNames) -> Result<(), ConfigError> {
        peers.validate()?;
        self.peers = peers;
        Ok(())
    }

    pub fn set_script_path(&mut self, path: Option<PathBuf>) -> Result<(), ConfigError> {
        let empty = !path.as_ref().is_some_and(|p| !p.as_os_str().is_empty());
        if empty && self.steps.run_script {
            return Err(ConfigError::ScriptPathRequired);
        }
        self.script_path = if empty { None } else { path };
        Ok(())
    }

    pub fn set_server(&mut self, server: ServerSettings) -> Result<(), ConfigError> {
        server.validate()?;
        self.server = server;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WatchdogConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mount_policy, MountPolicy::Ignored);
        assert!(config.steps.is_empty());
        assert_eq!(config.server.address(), "localhost:7624");
    }

    #[test]
    fn test_toml_loading() {
        let config = WatchdogConfig::from_toml(
            r#"
            heartbeat_timeout_seconds = 60
            weather_grace_seconds = 30
            mount_policy = "Locks"
            script_path = "/usr/local/bin/observatory-off"

            [steps]
            park_mount = true
            park_dome = true
            run_script = true

            [triggers]
            client_heartbeat = true
            weather = true

            [peers]
            telescope = "EQMod Mount"
            "#,
        )
        .unwrap();

        assert_eq!(config.heartbeat_timeout_seconds, 60);
        assert_eq!(config.mount_policy, MountPolicy::Locks);
        assert_eq!(config.peers.telescope, "EQMod Mount");
        assert_eq!(config.peers.dome, "Dome Simulator");
        assert_eq!(
            config.steps.ordered(),
            vec![
                ShutdownStep::ParkMount,
                ShutdownStep::ParkDome,
                ShutdownStep::RunScript
            ]
        );
    }

    #[test]
    fn test_toml_rejects_client_trigger_without_threshold() {
        let result = WatchdogConfig::from_toml(
            r#"
            [triggers]
            client_heartbeat = true
            "#,
        );
        assert!(matches!(
            result,
            Err(WatchdogError::Config(ConfigError::HeartbeatThresholdRequired))
        ));
    }

    #[test]
    fn test_set_triggers_rejection_keeps_previous() {
        let mut config = WatchdogConfig::default();
        config
            .set_triggers(ShutdownTriggers::from_triggers(&[ShutdownTrigger::Weather]))
            .unwrap();

        let err = config
            .set_triggers(ShutdownTriggers::from_triggers(&[
                ShutdownTrigger::ClientHeartbeat,
                ShutdownTrigger::Weather,
            ]))
            .unwrap_err();

        assert_eq!(err, ConfigError::HeartbeatThresholdRequired);
        assert!(config.triggers.weather);
        assert!(!config.triggers.client_heartbeat);
    }

    #[test]
    fn test_script_step_requires_path() {
        let mut config = WatchdogConfig::default();
        let steps = ShutdownSteps::from_steps(&[ShutdownStep::RunScript]);
        assert_eq!(config.set_steps(steps), Err(ConfigError::ScriptPathRequired));

        config
            .set_script_path(Some(PathBuf::from("/bin/shutdown-observatory")))
            .unwrap();
        assert!(config.set_steps(steps).is_ok());

        // Clearing the path while the step depends on it is refused.
        assert_eq!(config.set_script_path(None), Err(ConfigError::ScriptPathRequired));
        assert!(config.has_script());
    }

    #[test]
    fn test_server_validation() {
        let mut config = WatchdogConfig::default();
        let bad = ServerSettings {
            host: String::new(),
            port: 7624,
        };
        assert!(config.set_server(bad).is_err());
        assert_eq!(config.server, ServerSettings::default());
    }
}
