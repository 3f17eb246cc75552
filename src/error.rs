use std::path::PathBuf;
use thiserror::Error;

use crate::bus::ParkTarget;

/// Rejections of an operator write or a config file. The previous value is
/// always retained when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("heart beat timeout should be set first")]
    HeartbeatThresholdRequired,

    #[error("shutdown script file is not set")]
    ScriptPathRequired,

    #[error("cannot change {property} while shutdown is in progress")]
    ShutdownInProgress { property: &'static str },

    #[error("peer device name for {role} is empty")]
    EmptyDeviceName { role: &'static str },

    #[error("invalid property server address {host}:{port}")]
    InvalidServer { host: String, port: u16 },

    #[error("poll interval must be greater than zero")]
    InvalidPollInterval,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("property bus is not connected")]
    NotConnected,

    #[error("no {0} device configured")]
    NoPeer(ParkTarget),

    #[error("property bus link closed")]
    LinkClosed,

    #[error("no async runtime available to drive the bus link")]
    NoRuntime,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to launch {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting on {path}: {source}")]
    Wait {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Message exceeds buffer size")]
    MessageTooLarge,
    #[error("Serialization failed")]
    SerializationError,
    #[error("Invalid command")]
    InvalidCommand,
    #[error("Invalid parameter")]
    InvalidParameter,
}

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {details}")]
    ConfigParse { path: PathBuf, details: String },
}

pub type Result<T> = std::result::Result<T, WatchdogError>;
