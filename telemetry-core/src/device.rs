//! Per-device state and the registry that owns it.
//!
//! A [`DeviceState`] is created lazily on the first datagram carrying an
//! unseen device id and lives for the lifetime of the server. The registry
//! has a single owner (the dispatch loop); it is never shared behind a lock.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use serde::Serialize;

use crate::protocol::message::Mode;

/// Tracking and liveness state for one device
#[derive(Debug, Clone)]
pub struct DeviceState {
    /// Sequence number of the last accepted packet
    pub last_seq: Option<u16>,
    /// Wire timestamp of the last accepted packet
    pub last_timestamp: Option<u32>,
    /// 64-bit unwrapped sender clock of the most recent packet
    pub last_full_timestamp: Option<u64>,
    /// Every sequence number ever seen since the last Init
    pub received_seqs: HashSet<u16>,
    /// Sequence numbers seen more than once
    pub duplicate_seqs: HashSet<u16>,
    /// Cumulative count of missing sequence numbers
    pub gap_count: u64,
    pub mode: Mode,
    /// Last network endpoint the device sent from
    pub address: Option<SocketAddr>,
    /// Server clock (ms) of the last liveness signal
    pub last_heartbeat_ms: Option<u64>,
    pub missed_heartbeats: u32,
    pub connected: bool,
    /// Packets processed for this device, any type
    pub packets_received: u64,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceState {
    /// Create a fresh device. Devices start out connected.
    pub fn new() -> Self {
        DeviceState {
            last_seq: None,
            last_timestamp: None,
            last_full_timestamp: None,
            received_seqs: HashSet::new(),
            duplicate_seqs: HashSet::new(),
            gap_count: 0,
            mode: Mode::Unknown,
            address: None,
            last_heartbeat_ms: None,
            missed_heartbeats: 0,
            connected: true,
            packets_received: 0,
        }
    }

    /// Reset sequence tracking on an Init message.
    ///
    /// The Init packet becomes the new baseline and its sequence number the
    /// only one considered received.
    pub fn reset(&mut self, seq: u16, timestamp: u32) {
        self.last_seq = Some(seq);
        self.last_timestamp = Some(timestamp);
        self.received_seqs.clear();
        self.received_seqs.insert(seq);
        self.duplicate_seqs.clear();
        self.gap_count = 0;
    }

    /// Extend a 32-bit wire timestamp onto a 64-bit timeline.
    ///
    /// The step from the newest timestamp seen is taken modulo 2^32 and read
    /// as signed: a forward step under 2^31 (including one across the wrap)
    /// advances the timeline, a backward step is a late packet and is placed
    /// behind the newest value without moving it.
    pub fn unwrap_timestamp(&mut self, wrapped: u32) -> u64 {
        let Some(last) = self.last_full_timestamp else {
            self.last_full_timestamp = Some(wrapped as u64);
            return wrapped as u64;
        };

        let step = wrapped.wrapping_sub(last as u32) as i32;
        if step >= 0 {
            let full = last + step as u64;
            self.last_full_timestamp = Some(full);
            full
        } else {
            last.saturating_sub(step.unsigned_abs() as u64)
        }
    }

    pub fn summary(&self, device_id: u16) -> DeviceSummary {
        DeviceSummary {
            device_id,
            packets_received: self.packets_received,
            unique_seqs: self.received_seqs.len(),
            duplicate_seqs: self.duplicate_seqs.len(),
            gap_count: self.gap_count,
            mode: self.mode,
            connected: self.connected,
            address: self.address,
        }
    }
}

/// Serialisable snapshot of a device's totals
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: u16,
    pub packets_received: u64,
    pub unique_seqs: usize,
    pub duplicate_seqs: usize,
    pub gap_count: u64,
    pub mode: Mode,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddr>,
}

// =============================================================================
// Registry
// =============================================================================

/// Mapping from device id to [`DeviceState`]
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<u16, DeviceState>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            devices: HashMap::new(),
        }
    }

    /// Look up a device, creating it on first sight.
    pub fn get_or_create(&mut self, device_id: u16) -> &mut DeviceState {
        self.devices.entry(device_id).or_insert_with(|| {
            log::info!("New device {}", device_id);
            DeviceState::new()
        })
    }

    /// Look up (or create) a device and record the address it sent from.
    pub fn observe(&mut self, device_id: u16, address: SocketAddr) -> &mut DeviceState {
        let state = self.get_or_create(device_id);
        if state.address != Some(address) {
            log::debug!("Device {} now at {}", device_id, address);
            state.address = Some(address);
        }
        state.packets_received += 1;
        state
    }

    pub fn get(&self, device_id: u16) -> Option<&DeviceState> {
        self.devices.get(&device_id)
    }

    pub fn get_mut(&mut self, device_id: u16) -> Option<&mut DeviceState> {
        self.devices.get_mut(&device_id)
    }

    pub fn contains(&self, device_id: u16) -> bool {
        self.devices.contains_key(&device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &DeviceState)> {
        self.devices.iter().map(|(id, s)| (*id, s))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u16, &mut DeviceState)> {
        self.devices.iter_mut().map(|(id, s)| (*id, s))
    }

    /// Summaries of all devices, ordered by device id
    pub fn summaries(&self) -> Vec<DeviceSummary> {
        let mut summaries: Vec<_> = self.iter().map(|(id, s)| s.summary(id)).collect();
        summaries.sort_by_key(|s| s.device_id);
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_lazy_creation() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(7).is_none());

        let state = registry.get_or_create(7);
        assert!(state.connected);
        assert_eq!(state.mode, Mode::Unknown);
        assert_eq!(state.last_seq, None);

        registry.get_or_create(7).gap_count = 3;
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(7).unwrap().gap_count, 3);
    }

    #[test]
    fn test_observe_tracks_latest_address() {
        let mut registry = DeviceRegistry::new();
        registry.observe(1, addr(5000));
        registry.observe(1, addr(5001));
        let state = registry.get(1).unwrap();
        assert_eq!(state.address, Some(addr(5001)));
        assert_eq!(state.packets_received, 2);
    }

    #[test]
    fn test_reset() {
        let mut state = DeviceState::new();
        state.last_seq = Some(900);
        state.last_timestamp = Some(5000);
        state.received_seqs.extend([898, 899, 900]);
        state.duplicate_seqs.insert(899);
        state.gap_count = 12;

        state.reset(0, 100);
        assert_eq!(state.last_seq, Some(0));
        assert_eq!(state.last_timestamp, Some(100));
        assert_eq!(state.received_seqs, HashSet::from([0]));
        assert!(state.duplicate_seqs.is_empty());
        assert_eq!(state.gap_count, 0);
    }

    #[test]
    fn test_unwrap_timestamp() {
        let mut state = DeviceState::new();
        assert_eq!(state.unwrap_timestamp(4_000_000_000), 4_000_000_000);
        assert_eq!(state.unwrap_timestamp(4_294_967_000), 4_294_967_000);
        // Wrapped past 2^32
        assert_eq!(state.unwrap_timestamp(500), (1u64 << 32) + 500);
        assert_eq!(state.unwrap_timestamp(1500), (1u64 << 32) + 1500);
    }

    #[test]
    fn test_unwrap_late_timestamp() {
        let mut state = DeviceState::new();
        let unwrapped: Vec<_> = [1000, 3000, 2000, 4000]
            .into_iter()
            .map(|ts| state.unwrap_timestamp(ts))
            .collect();
        assert_eq!(unwrapped, vec![1000, 3000, 2000, 4000]);
        assert_eq!(state.last_full_timestamp, Some(4000));
    }

    #[test]
    fn test_unwrap_late_timestamp_across_wrap() {
        let mut state = DeviceState::new();
        state.unwrap_timestamp(4_294_967_000);
        assert_eq!(state.unwrap_timestamp(200), (1u64 << 32) + 200);
        // Sent before the wrap, arrived after it
        assert_eq!(state.unwrap_timestamp(4_294_967_100), 4_294_967_100);
        assert_eq!(state.unwrap_timestamp(300), (1u64 << 32) + 300);
    }

    #[test]
    fn test_summaries_sorted() {
        let mut registry = DeviceRegistry::new();
        registry.get_or_create(30);
        registry.get_or_create(10);
        registry.get_or_create(20);
        let ids: Vec<_> = registry.summaries().iter().map(|s| s.device_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_summary_serialises() {
        let mut state = DeviceState::new();
        state.mode = Mode::Batch;
        let json = serde_json::to_value(state.summary(5)).unwrap();
        assert_eq!(json["deviceId"], 5);
        assert_eq!(json["mode"], "batch");
        assert!(json.get("address").is_none());
    }
}
