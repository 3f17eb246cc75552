//! Weather hazard monitoring with an optional grace period.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::shutdown::ShutdownCause;
use crate::timer::CountdownTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WeatherState {
    #[default]
    Safe,
    Hazard,
}

/// Owns the cached [`WeatherState`] and the pending-hazard countdown.
/// The cache is written only by [`WeatherMonitor::on_hazard_update`].
#[derive(Debug, Default)]
pub struct WeatherMonitor {
    state: WeatherState,
    grace: CountdownTimer,
    hazard_since_ms: Option<u64>,
}

impl WeatherMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a trigger only when the hazard must act immediately
    /// (zero grace period). Otherwise a trigger comes later from [`poll`].
    ///
    /// [`poll`]: WeatherMonitor::poll
    pub fn on_hazard_update(
        &mut self,
        now_ms: u64,
        new_state: WeatherState,
        trigger_enabled: bool,
        grace_seconds: u32,
    ) -> Option<ShutdownCause> {
        let previous = self.state;
        self.state = new_state;

        match (previous, new_state) {
            (WeatherState::Safe, WeatherState::Hazard) => {
                warn!("Weather is in DANGER zone.");
                self.hazard_since_ms = Some(now_ms);
                if !trigger_enabled || self.grace.is_armed() {
                    return None;
                }
                if grace_seconds == 0 {
                    return Some(ShutdownCause::Weather);
                }
                info!(
                    "Shutdown procedure shall commence in {} seconds unless weather status improves.",
                    grace_seconds
                );
                self.grace.arm(now_ms, grace_seconds);
                None
            }
            (WeatherState::Hazard, WeatherState::Safe) => {
                info!("Weather status is no longer in DANGER zone.");
                self.hazard_since_ms = None;
                if self.grace.cancel() {
                    info!("Shutdown procedure cancelled.");
                }
                None
            }
            _ => None,
        }
    }

    pub fn on_trigger_disabled(&mut self) {
        self.grace.cancel();
        info!("Weather Watchdog is disabled.");
    }

    /// Drop any pending countdown without touching the cached state.
    pub fn disarm(&mut self) {
        self.grace.cancel();
    }

    pub fn poll(&mut self, now_ms: u64) -> Option<ShutdownCause> {
        if self.grace.poll_expired(now_ms) {
            warn!("Weather grace period expired while in DANGER zone");
            Some(ShutdownCause::Weather)
        } else {
            None
        }
    }

    pub fn state(&self) -> WeatherState {
        self.state
    }

    pub fn is_hazard(&self) -> bool {
        self.state == WeatherState::Hazard
    }

    pub fn grace_pending(&self) -> bool {
        self.grace.is_armed()
    }

    pub fn grace_remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.grace.remaining_ms(now_ms)
    }

    pub fn hazard_since_ms(&self) -> Option<u64> {
        self.hazard_since_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_hazard_absorbed_by_grace() {
        let mut monitor = WeatherMonitor::new();
        assert_eq!(monitor.on_hazard_update(0, WeatherState::Hazard, true, 30), None);
        assert!(monitor.grace_pending());

        assert_eq!(monitor.on_hazard_update(10_000, WeatherState::Safe, true, 30), None);
        assert!(!monitor.grace_pending());
        assert_eq!(monitor.poll(60_000), None);
    }

    #[test]
    fn test_grace_expiry_raises_trigger() {
        let mut monitor = WeatherMonitor::new();
        monitor.on_hazard_update(0, WeatherState::Hazard, true, 30);
        assert_eq!(monitor.poll(29_000), None);
        assert_eq!(monitor.poll(30_000), Some(ShutdownCause::Weather));
        assert_eq!(monitor.poll(31_000), None);
    }

    #[test]
    fn test_zero_grace_fires_immediately() {
        let mut monitor = WeatherMonitor::new();
        assert_eq!(
            monitor.on_hazard_update(0, WeatherState::Hazard, true, 0),
            Some(ShutdownCause::Weather)
        );
        assert!(!monitor.grace_pending());
    }

    #[test]
    fn test_repeated_hazard_is_noop() {
        let mut monitor = WeatherMonitor::new();
        monitor.on_hazard_update(0, WeatherState::Hazard, true, 30);
        monitor.on_hazard_update(20_000, WeatherState::Hazard, true, 30);
        // The original countdown is kept, not restarted.
        assert_eq!(monitor.grace_remaining_ms(20_000), Some(10_000));
        assert_eq!(monitor.hazard_since_ms(), Some(0));
    }

    #[test]
    fn test_trigger_disabled_still_tracks_state() {
        let mut monitor = WeatherMonitor::new();
        assert_eq!(monitor.on_hazard_update(0, WeatherState::Hazard, false, 0), None);
        assert!(monitor.is_hazard());
        assert!(!monitor.grace_pending());
    }
}
