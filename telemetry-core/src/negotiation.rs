//! Batch/single mode negotiation.
//!
//! A device asks for a reporting mode with a CONFIG packet carrying
//! `MODE=<single|batch>`. The server records the mode and confirms it with a
//! CONFIG reply sent to the device's last observed address. The server never
//! picks a mode on its own.

use std::net::SocketAddr;

use crate::device::DeviceRegistry;
use crate::error::NegotiationError;
use crate::protocol::message::{parse_mode_request, Mode};
use crate::protocol::{wire_timestamp, Flags, MessageType, Packet};

/// A confirmed mode change and the datagram to send back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigReply {
    pub device_id: u16,
    pub address: SocketAddr,
    pub previous: Mode,
    pub mode: Mode,
    pub packet: Packet,
}

impl ConfigReply {
    pub fn encode(&self) -> Vec<u8> {
        self.packet.encode()
    }

    pub fn changed(&self) -> bool {
        self.previous != self.mode
    }
}

/// Build the CONFIG packet confirming `mode`.
///
/// The sequence number is unused in replies and always 0.
pub fn config_packet(device_id: u16, mode: Mode, now_ms: u64) -> Packet {
    Packet::new(
        MessageType::Config,
        device_id,
        0,
        wire_timestamp(now_ms),
        Flags::empty(),
        mode.config_payload(),
    )
}

/// Apply an already validated mode to a device.
///
/// Fails without touching the device if it has never been seen or has no
/// known address.
pub fn apply_mode(
    registry: &mut DeviceRegistry,
    device_id: u16,
    mode: Mode,
    now_ms: u64,
) -> Result<ConfigReply, NegotiationError> {
    let state = registry
        .get_mut(device_id)
        .ok_or(NegotiationError::UnknownDevice(device_id))?;
    let address = state
        .address
        .ok_or(NegotiationError::UnknownAddress(device_id))?;

    let previous = state.mode;
    state.mode = mode;

    Ok(ConfigReply {
        device_id,
        address,
        previous,
        mode,
        packet: config_packet(device_id, mode, now_ms),
    })
}

/// Handle a raw CONFIG payload from a device.
pub fn negotiate(
    registry: &mut DeviceRegistry,
    device_id: u16,
    payload: &str,
    now_ms: u64,
) -> Result<ConfigReply, NegotiationError> {
    let mode = parse_mode_request(payload)?;
    apply_mode(registry, device_id, mode, now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode;

    fn addr() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 50], 40000))
    }

    #[test]
    fn test_negotiate_sets_mode_and_replies() {
        let mut registry = DeviceRegistry::new();
        registry.observe(1001, addr());

        let reply = negotiate(&mut registry, 1001, "MODE=Single", 5000).unwrap();
        assert_eq!(reply.address, addr());
        assert_eq!(reply.previous, Mode::Unknown);
        assert_eq!(reply.mode, Mode::Single);
        assert!(reply.changed());
        assert_eq!(registry.get(1001).unwrap().mode, Mode::Single);

        let packet = decode(&reply.encode()).unwrap();
        assert_eq!(packet.msg_type, MessageType::Config);
        assert_eq!(packet.device_id, 1001);
        assert_eq!(packet.seq, 0);
        assert_eq!(packet.timestamp, 5000);
        assert_eq!(packet.payload, "MODE=single");
    }

    #[test]
    fn test_invalid_mode_leaves_state() {
        let mut registry = DeviceRegistry::new();
        registry.observe(1, addr());
        registry.get_mut(1).unwrap().mode = Mode::Batch;

        let err = negotiate(&mut registry, 1, "MODE=fast", 0).unwrap_err();
        assert_eq!(err, NegotiationError::InvalidMode("fast".into()));
        assert_eq!(registry.get(1).unwrap().mode, Mode::Batch);
    }

    #[test]
    fn test_unknown_address() {
        let mut registry = DeviceRegistry::new();
        registry.get_or_create(2);

        let err = apply_mode(&mut registry, 2, Mode::Batch, 0).unwrap_err();
        assert_eq!(err, NegotiationError::UnknownAddress(2));
        assert_eq!(registry.get(2).unwrap().mode, Mode::Unknown);
    }

    #[test]
    fn test_unknown_device() {
        let mut registry = DeviceRegistry::new();
        let err = apply_mode(&mut registry, 3, Mode::Single, 0).unwrap_err();
        assert_eq!(err, NegotiationError::UnknownDevice(3));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_mode_still_replies() {
        let mut registry = DeviceRegistry::new();
        registry.observe(4, addr());
        negotiate(&mut registry, 4, "MODE=batch", 0).unwrap();
        let reply = negotiate(&mut registry, 4, "MODE=batch", 10).unwrap();
        assert!(!reply.changed());
    }
}
