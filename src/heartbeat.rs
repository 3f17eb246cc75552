//! Client heartbeat monitoring.
//!
//! The controlling client proves it is alive by periodically writing the
//! heartbeat threshold. Each write restarts the countdown; if the countdown
//! runs out the monitor raises a [`ShutdownCause::HeartbeatLoss`] trigger.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ShutdownSteps;
use crate::shutdown::ShutdownCause;
use crate::timer::CountdownTimer;

/// Outcome of a heartbeat write, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatStatus {
    /// Countdown restarted for this many seconds.
    Armed { seconds: u32 },
    /// Threshold of zero: the client watchdog is off.
    Disabled,
    /// Client trigger is not selected; nothing is armed.
    TriggerOff,
}

#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    timer: CountdownTimer,
    last_heartbeat_ms: Option<u64>,
    armed_seconds: u32,
    timeouts: u32,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_heartbeat_received(
        &mut self,
        now_ms: u64,
        interval_seconds: u32,
        trigger_enabled: bool,
    ) -> HeartbeatStatus {
        self.timer.cancel();

        if !trigger_enabled {
            return HeartbeatStatus::TriggerOff;
        }

        if interval_seconds == 0 {
            info!("Client Watchdog is disabled.");
            return HeartbeatStatus::Disabled;
        }

        if interval_seconds != self.armed_seconds {
            info!(
                "Client Watchdog is enabled. Shutdown is triggered after {} seconds of communication loss with the client.",
                interval_seconds
            );
        }
        debug!("Received heart beat from client.");

        self.last_heartbeat_ms = Some(now_ms);
        self.arm(now_ms, interval_seconds);
        HeartbeatStatus::Armed {
            seconds: interval_seconds,
        }
    }

    /// Client trigger switched on, or the watchdog connected with the trigger on.
    pub fn on_trigger_enabled(&mut self, now_ms: u64, threshold_seconds: u32) {
        if threshold_seconds == 0 {
            return;
        }
        info!(
            "Client Watchdog is enabled. Shutdown is triggered after {} seconds of communication loss with the client.",
            threshold_seconds
        );
        self.arm(now_ms, threshold_seconds);
    }

    pub fn on_trigger_disabled(&mut self) {
        if self.timer.cancel() {
            debug!("Client heartbeat countdown cancelled");
        }
        self.armed_seconds = 0;
    }

    /// Fires at most once per armed countdown. A timeout with no shutdown
    /// step enabled is dropped.
    pub fn poll(&mut self, now_ms: u64, steps: &ShutdownSteps) -> Option<ShutdownCause> {
        if !self.timer.poll_expired(now_ms) {
            return None;
        }
        self.timeouts = self.timeouts.saturating_add(1);
        self.armed_seconds = 0;

        if steps.is_empty() {
            debug!("Heart beat timed out but no shutdown step is selected");
            return None;
        }

        warn!("Heartbeat threshold timed out");
        Some(ShutdownCause::HeartbeatLoss)
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }

    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.timer.remaining_ms(now_ms)
    }

    pub fn last_heartbeat_ms(&self) -> Option<u64> {
        self.last_heartbeat_ms
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    fn arm(&mut self, now_ms: u64, seconds: u32) {
        self.timer.arm(now_ms, seconds);
        self.armed_seconds = seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShutdownStep;

    fn park_mount() -> ShutdownSteps {
        ShutdownSteps::from_steps(&[ShutdownStep::ParkMount])
    }

    #[test]
    fn test_timeout_after_missed_heartbeat() {
        let mut monitor = HeartbeatMonitor::new();
        let status = monitor.on_heartbeat_received(0, 60, true);
        assert_eq!(status, HeartbeatStatus::Armed { seconds: 60 });

        assert_eq!(monitor.poll(59_000, &park_mount()), None);
        assert_eq!(
            monitor.poll(61_000, &park_mount()),
            Some(ShutdownCause::HeartbeatLoss)
        );
        // Never re-armed automatically.
        assert_eq!(monitor.poll(200_000, &park_mount()), None);
        assert_eq!(monitor.timeouts(), 1);
    }

    #[test]
    fn test_heartbeat_restarts_countdown() {
        let mut monitor = HeartbeatMonitor::new();
        monitor.on_heartbeat_received(0, 60, true);
        monitor.on_heartbeat_received(50_000, 60, true);

        assert_eq!(monitor.poll(70_000, &park_mount()), None);
        assert_eq!(monitor.remaining_ms(70_000), Some(40_000));
        assert_eq!(monitor.last_heartbeat_ms(), Some(50_000));
    }

    #[test]
    fn test_zero_interval_disables() {
        let mut monitor = HeartbeatMonitor::new();
        monitor.on_heartbeat_received(0, 60, true);
        assert_eq!(
            monitor.on_heartbeat_received(10_000, 0, true),
            HeartbeatStatus::Disabled
        );
        assert!(!monitor.is_armed());
    }

    #[test]
    fn test_trigger_off_arms_nothing() {
        let mut monitor = HeartbeatMonitor::new();
        assert_eq!(
            monitor.on_heartbeat_received(0, 60, false),
            HeartbeatStatus::TriggerOff
        );
        assert!(!monitor.is_armed());
    }

    #[test]
    fn test_disable_cancels_pending_timeout() {
        let mut monitor = HeartbeatMonitor::new();
        monitor.on_trigger_enabled(0, 30);
        monitor.on_trigger_disabled();
        assert_eq!(monitor.poll(60_000, &park_mount()), None);
    }

    #[test]
    fn test_timeout_dropped_without_steps() {
        let mut monitor = HeartbeatMonitor::new();
        monitor.on_trigger_enabled(0, 1);
        assert_eq!(monitor.poll(1000, &ShutdownSteps::default()), None);
        assert!(!monitor.is_armed());
    }
}
