//! The property bus as seen by the watchdog.
//!
//! Peer devices are reached only through a [`PropertyBus`]: set a named
//! property, snoop a peer's property, read the cached park state, and report
//! connection liveness. Raw property updates are decoded once, here, into
//! [`PeerEvent`]s so the rest of the crate never compares property names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ServerSettings;
use crate::error::BusError;
use crate::weather::WeatherState;

pub const WEATHER_STATUS: &str = "WEATHER_STATUS";
pub const TELESCOPE_PARK: &str = "TELESCOPE_PARK";
pub const DOME_PARK: &str = "DOME_PARK";
pub const PARK_ELEMENT: &str = "PARK";
pub const UNPARK_ELEMENT: &str = "UNPARK";

/// Overall state indicator carried by every property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParkTarget {
    Mount,
    Dome,
}

impl ParkTarget {
    pub fn property(self) -> &'static str {
        match self {
            ParkTarget::Mount => TELESCOPE_PARK,
            ParkTarget::Dome => DOME_PARK,
        }
    }
}

impl fmt::Display for ParkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParkTarget::Mount => write!(f, "mount"),
            ParkTarget::Dome => write!(f, "dome"),
        }
    }
}

/// Read-only view of a peer's park progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParkState {
    Parking,
    Parked,
    /// Alert, or nothing reported yet.
    #[default]
    Unknown,
}

impl From<PropertyState> for ParkState {
    fn from(state: PropertyState) -> Self {
        match state {
            PropertyState::Busy => ParkState::Parking,
            PropertyState::Ok | PropertyState::Idle => ParkState::Parked,
            PropertyState::Alert => ParkState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchElement {
    pub name: String,
    pub on: bool,
}

/// A property update as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub device: String,
    pub property: String,
    pub state: PropertyState,
    #[serde(default)]
    pub elements: Vec<SwitchElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkReport {
    pub device: String,
    pub state: PropertyState,
    /// `PARK`/`UNPARK` switch pair; `None` when neither element is on.
    pub parked: Option<bool>,
}

impl ParkReport {
    /// An idle or ok report with `UNPARK` on is not a finished park.
    pub fn park_state(&self) -> ParkState {
        match ParkState::from(self.state) {
            ParkState::Parked if self.parked == Some(false) => ParkState::Unknown,
            state => state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerEvent {
    Weather { device: String, state: WeatherState },
    Park { target: ParkTarget, report: ParkReport },
}

impl PeerEvent {
    /// Decode a raw update. Properties the watchdog does not watch yield `None`.
    pub fn decode(update: &PropertyUpdate) -> Option<Self> {
        let target = match update.property.as_str() {
            WEATHER_STATUS => {
                let state = if update.state == PropertyState::Alert {
                    WeatherState::Hazard
                } else {
                    WeatherState::Safe
                };
                return Some(PeerEvent::Weather {
                    device: update.device.clone(),
                    state,
                });
            }
            TELESCOPE_PARK => ParkTarget::Mount,
            DOME_PARK => ParkTarget::Dome,
            _ => return None,
        };

        let mut parked = None;
        for element in update.elements.iter().filter(|e| e.on) {
            match element.name.as_str() {
                PARK_ELEMENT => parked = Some(true),
                UNPARK_ELEMENT => parked = Some(false),
                _ => {}
            }
        }

        Some(PeerEvent::Park {
            target,
            report: ParkReport {
                device: update.device.clone(),
                state: update.state,
                parked,
            },
        })
    }
}

/// Client side of the property bus. Implemented by the daemon's TCP link and
/// by in-memory doubles in tests.
pub trait PropertyBus {
    /// Start connecting to the property server. Completion is observed
    /// through [`PropertyBus::is_connected`] on later polls.
    fn connect(&mut self, server: &ServerSettings) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;

    /// Subscribe to updates of `property` on `device`.
    fn snoop(&mut self, device: &str, property: &str) -> Result<(), BusError>;

    /// Fire-and-forget switch write. `Ok` only means the write was issued.
    fn set_switch(&mut self, device: &str, property: &str, element: &str) -> Result<(), BusError>;

    /// Last known park state of `device`.
    fn park_state(&self, device: &str, target: ParkTarget) -> ParkState;

    fn park(&mut self, device: &str, target: ParkTarget) -> Result<(), BusError> {
        if device.is_empty() {
            return Err(BusError::NoPeer(target));
        }
        self.set_switch(device, target.property(), PARK_ELEMENT)
    }
}
