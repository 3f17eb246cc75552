//! Re-park devices that get unparked while the weather is hazardous.
//!
//! Runs on every peer park update, independently of the shutdown stage: an
//! operator (or other software) unparking during an active hazard is exactly
//! what this guard catches.

use tracing::{error, info, warn};

use crate::bus::{ParkReport, ParkTarget, PropertyBus, PropertyState};
use crate::config::{ShutdownStep, WatchdogConfig};
use crate::weather::WeatherState;

#[derive(Debug, Default)]
pub struct ReArmGuard {
    mount_parked: Option<bool>,
    dome_parked: Option<bool>,
    reissued: u32,
}

impl ReArmGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe<B: PropertyBus>(
        &mut self,
        target: ParkTarget,
        report: &ParkReport,
        weather: WeatherState,
        config: &WatchdogConfig,
        bus: &mut B,
    ) {
        if report.state == PropertyState::Alert {
            return;
        }
        let Some(parked) = report.parked else {
            return;
        };

        let cached = match target {
            ParkTarget::Mount => &mut self.mount_parked,
            ParkTarget::Dome => &mut self.dome_parked,
        };
        if *cached == Some(parked) {
            return;
        }
        *cached = Some(parked);

        let label = match target {
            ParkTarget::Mount => "Mount",
            ParkTarget::Dome => "Dome",
        };
        info!("{} is {}", label, if parked { "Parked" } else { "Unparked" });

        let step = match target {
            ParkTarget::Mount => ShutdownStep::ParkMount,
            ParkTarget::Dome => ShutdownStep::ParkDome,
        };
        if parked
            || !config.triggers.weather
            || weather != WeatherState::Hazard
            || !config.steps.contains(step)
        {
            return;
        }

        warn!(
            "{} unparked while weather alert is active! Parking {}...",
            label, target
        );
        if let Err(e) = bus.park(&report.device, target) {
            error!("Unable to re-park {}: {}", target, e);
            return;
        }
        self.reissued = self.reissued.saturating_add(1);
    }

    pub fn reissued(&self) -> u32 {
        self.reissued
    }

    /// Forget cached park flags, e.g. after the peer devices change.
    pub fn clear(&mut self) {
        self.mount_parked = None;
        self.dome_parked = None;
    }
}
