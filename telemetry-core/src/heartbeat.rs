//! Heartbeat liveness state machine.
//!
//! ```text
//!            liveness signal
//!        ┌──────────────────────┐
//!        ▼                      │
//!  ┌───────────┐  missed >= max  ┌──────────────┐
//!  │ Connected │ ───────────────▶│ Disconnected │
//!  └───────────┘   (edge, once)  └──────────────┘
//! ```
//!
//! Devices start out `Connected`. Any packet from a device counts as a
//! liveness signal, because devices only send explicit heartbeats while they
//! have no data to send. A periodic [`HeartbeatMonitor::sweep`] recomputes the
//! missed count from the elapsed silence and flips a device to
//! `Disconnected` exactly once.
//!
//! This is a pure state machine with no I/O; the caller supplies the clock.

use serde::{Deserialize, Serialize};

use crate::device::{DeviceRegistry, DeviceState};

/// Expected interval between liveness signals (milliseconds)
pub const HEARTBEAT_INTERVAL_MS: u64 = 6000;

/// Missed intervals after which a device is considered disconnected
pub const MAX_MISSED_HEARTBEATS: u32 = 5;

/// Default cadence of the liveness sweep (milliseconds)
pub const SWEEP_INTERVAL_MS: u64 = 1000;

/// Liveness of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessState {
    Connected,
    Disconnected,
}

impl std::fmt::Display for LivenessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LivenessState::Connected => write!(f, "Connected"),
            LivenessState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

impl DeviceState {
    pub fn liveness(&self) -> LivenessState {
        if self.connected {
            LivenessState::Connected
        } else {
            LivenessState::Disconnected
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
    pub max_missed: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        HeartbeatSettings {
            interval_ms: HEARTBEAT_INTERVAL_MS,
            max_missed: MAX_MISSED_HEARTBEATS,
        }
    }
}

/// Liveness transitions worth reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Device crossed the missed-heartbeat threshold
    Disconnected {
        device_id: u16,
        missed: u32,
        silent_ms: u64,
    },
    /// A disconnected device was heard from again
    Reconnected { device_id: u16 },
}

/// Applies liveness signals and periodic sweeps to device state
#[derive(Debug, Clone, Default)]
pub struct HeartbeatMonitor {
    settings: HeartbeatSettings,
}

impl HeartbeatMonitor {
    pub fn new(settings: HeartbeatSettings) -> Self {
        // interval_ms is a divisor in check()
        let settings = HeartbeatSettings {
            interval_ms: settings.interval_ms.max(1),
            ..settings
        };
        HeartbeatMonitor { settings }
    }

    pub fn settings(&self) -> &HeartbeatSettings {
        &self.settings
    }

    /// Record a liveness signal from a device.
    ///
    /// Returns [`HeartbeatEvent::Reconnected`] if the device was disconnected.
    pub fn record(
        &self,
        device_id: u16,
        state: &mut DeviceState,
        now_ms: u64,
    ) -> Option<HeartbeatEvent> {
        state.last_heartbeat_ms = Some(now_ms);
        state.missed_heartbeats = 0;
        if state.connected {
            return None;
        }
        state.connected = true;
        Some(HeartbeatEvent::Reconnected { device_id })
    }

    /// Re-evaluate one device at `now_ms`.
    pub fn check(
        &self,
        device_id: u16,
        state: &mut DeviceState,
        now_ms: u64,
    ) -> Option<HeartbeatEvent> {
        let last = state.last_heartbeat_ms?;
        let elapsed = now_ms.saturating_sub(last);

        state.missed_heartbeats = if elapsed > self.settings.interval_ms {
            u32::try_from(elapsed / self.settings.interval_ms).unwrap_or(u32::MAX)
        } else {
            0
        };

        if state.connected && state.missed_heartbeats >= self.settings.max_missed {
            state.connected = false;
            return Some(HeartbeatEvent::Disconnected {
                device_id,
                missed: state.missed_heartbeats,
                silent_ms: elapsed,
            });
        }
        None
    }

    /// Sweep every device in the registry, returning transitions ordered by
    /// device id.
    pub fn sweep(&self, registry: &mut DeviceRegistry, now_ms: u64) -> Vec<HeartbeatEvent> {
        let mut events: Vec<_> = registry
            .iter_mut()
            .filter_map(|(id, state)| self.check(id, state, now_ms))
            .collect();
        events.sort_by_key(|e| match e {
            HeartbeatEvent::Disconnected { device_id, .. } => *device_id,
            HeartbeatEvent::Reconnected { device_id } => *device_id,
        });
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(HeartbeatSettings::default())
    }

    #[test]
    fn test_disconnect_fires_once() {
        let monitor = monitor();
        let mut registry = DeviceRegistry::new();
        monitor.record(1, registry.get_or_create(1), 0);

        let events = monitor.sweep(&mut registry, 42_000);
        assert_eq!(
            events,
            vec![HeartbeatEvent::Disconnected {
                device_id: 1,
                missed: 7,
                silent_ms: 42_000
            }]
        );
        assert!(!registry.get(1).unwrap().connected);

        // Still silent: state stays, no second event
        let events = monitor.sweep(&mut registry, 43_000);
        assert!(events.is_empty());
        assert_eq!(registry.get(1).unwrap().liveness(), LivenessState::Disconnected);
        assert_eq!(registry.get(1).unwrap().missed_heartbeats, 7);
    }

    #[test]
    fn test_missed_count_is_windowed() {
        let monitor = monitor();
        let mut state = DeviceState::new();
        monitor.record(1, &mut state, 1000);

        assert_eq!(monitor.check(1, &mut state, 7000), None);
        assert_eq!(state.missed_heartbeats, 0); // exactly one interval is not late

        monitor.check(1, &mut state, 13_500);
        assert_eq!(state.missed_heartbeats, 2);
        assert!(state.connected);

        monitor.check(1, &mut state, 25_000);
        assert_eq!(state.missed_heartbeats, 4);
        assert!(state.connected);

        assert!(monitor.check(1, &mut state, 31_001).is_some());
        assert_eq!(state.missed_heartbeats, 5);
    }

    #[test]
    fn test_signal_resets_and_reconnects() {
        let monitor = monitor();
        let mut state = DeviceState::new();
        monitor.record(3, &mut state, 0);
        monitor.check(3, &mut state, 60_000);
        assert!(!state.connected);

        let event = monitor.record(3, &mut state, 61_000);
        assert_eq!(event, Some(HeartbeatEvent::Reconnected { device_id: 3 }));
        assert!(state.connected);
        assert_eq!(state.missed_heartbeats, 0);

        // Connected devices don't report a reconnect
        assert_eq!(monitor.record(3, &mut state, 62_000), None);
    }

    #[test]
    fn test_device_without_signal_is_skipped() {
        let monitor = monitor();
        let mut registry = DeviceRegistry::new();
        registry.get_or_create(9);
        assert!(monitor.sweep(&mut registry, 1_000_000).is_empty());
        assert!(registry.get(9).unwrap().connected);
    }

    #[test]
    fn test_sweep_orders_events() {
        let monitor = monitor();
        let mut registry = DeviceRegistry::new();
        for id in [30, 10, 20] {
            monitor.record(id, registry.get_or_create(id), 0);
        }
        let ids: Vec<_> = monitor
            .sweep(&mut registry, 100_000)
            .into_iter()
            .map(|e| match e {
                HeartbeatEvent::Disconnected { device_id, .. } => device_id,
                HeartbeatEvent::Reconnected { device_id } => device_id,
            })
            .collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_clock_going_backwards() {
        let monitor = monitor();
        let mut state = DeviceState::new();
        monitor.record(1, &mut state, 50_000);
        assert_eq!(monitor.check(1, &mut state, 10_000), None);
        assert_eq!(state.missed_heartbeats, 0);
    }

    #[test]
    fn test_custom_settings() {
        let monitor = HeartbeatMonitor::new(HeartbeatSettings {
            interval_ms: 100,
            max_missed: 2,
        });
        let mut state = DeviceState::new();
        monitor.record(1, &mut state, 0);
        assert!(monitor.check(1, &mut state, 150).is_none());
        assert_eq!(state.missed_heartbeats, 1);
        assert!(monitor.check(1, &mut state, 200).is_some());
        assert_eq!(state.missed_heartbeats, 2);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let monitor = HeartbeatMonitor::new(HeartbeatSettings {
            interval_ms: 0,
            max_missed: 5,
        });
        assert_eq!(monitor.settings().interval_ms, 1);
    }
}
