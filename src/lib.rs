//! # Observatory Watchdog
//!
//! Automated shutdown coordinator for an unattended observatory. The watchdog
//! watches two independent hazard sources, the controlling client going
//! silent and the weather station entering a danger state, and when either
//! fires it drives an ordered shutdown across peer devices on a property bus:
//! park the mount, park the dome, then run a site-specific script.
//!
//! ## Features
//!
//! - **Client heartbeat**: countdown restarted by every heartbeat write
//! - **Weather grace period**: a transient hazard that clears in time is absorbed
//! - **Ordered shutdown**: mount, dome and script steps with a configurable mount policy
//! - **Re-arm guard**: devices unparked during an active hazard are parked again
//! - **Operator protocol**: JSON-line control port with status broadcasts
//!
//! ## Quick Start
//!
//! ```rust
//! use obswatch::bus::{ParkState, ParkTarget, PropertyBus};
//! use obswatch::config::{ServerSettings, ShutdownStep, ShutdownSteps, WatchdogConfig};
//! use obswatch::error::BusError;
//! use obswatch::Watchdog;
//!
//! #[derive(Default)]
//! struct Parked;
//!
//! impl PropertyBus for Parked {
//!     fn connect(&mut self, _: &ServerSettings) -> Result<(), BusError> { Ok(()) }
//!     fn is_connected(&self) -> bool { true }
//!     fn snoop(&mut self, _: &str, _: &str) -> Result<(), BusError> { Ok(()) }
//!     fn set_switch(&mut self, _: &str, _: &str, _: &str) -> Result<(), BusError> { Ok(()) }
//!     fn park_state(&self, _: &str, _: ParkTarget) -> ParkState { ParkState::Parked }
//! }
//!
//! let mut config = WatchdogConfig::default();
//! config.steps = ShutdownSteps::from_steps(&[ShutdownStep::ParkMount]);
//!
//! let mut watchdog = Watchdog::new(config, Parked);
//! watchdog.connect(0).unwrap();
//!
//! // Drive the event loop with a monotonic millisecond clock.
//! if let Some(status) = watchdog.update(1_000) {
//!     println!("shutdown stage: {}", status.stage);
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`watchdog`] - Device context and public API
//! - [`heartbeat`] / [`weather`] - Trigger sources
//! - [`shutdown`] - Shutdown sequencing state machine
//! - [`rearm`] - Re-park guard during hazards
//! - [`bus`] / [`link`] - Property bus abstraction and its TCP client
//! - [`protocol`] - Operator command/response protocol
//! - [`config`] - Configuration and validation

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod bus;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod link;
pub mod protocol;
pub mod rearm;
pub mod script;
pub mod shutdown;
pub mod timer;
pub mod watchdog;
pub mod weather;

// Re-export main public types for convenience
pub use config::WatchdogConfig;
pub use error::{Result, WatchdogError};
pub use protocol::{Command, CommandResponse, StatusReport};
pub use shutdown::{ShutdownCause, ShutdownStage};
pub use watchdog::Watchdog;
