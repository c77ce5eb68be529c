//! Telemetry wire protocol.
//!
//! Every datagram exchanged between a device and the server is either a
//! discovery sentinel or a [`Packet`]: a fixed 10-byte header followed by a
//! UTF-8 text payload.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|MsgType|           Device ID           |   Seq (hi)    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Seq (lo)    |                 Timestamp (ms)                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Ts (lowest)   |     Flags     |          Payload ...          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Discovery is out of band: a device broadcasts [`DISCOVERY_REQUEST`] and
//! the server answers with [`DISCOVERY_RESPONSE`]. Neither sentinel carries a
//! header, and the server learns nothing about the device from them.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

pub mod message;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Byte length of the fixed-size header on the wire
pub const HEADER_LEN: usize = 10;

/// Protocol version written by this implementation
pub const PROTOCOL_VERSION: u8 = 1;

/// Default UDP port of the telemetry server
pub const DEFAULT_PORT: u16 = 8576;

/// Receive buffer size; larger datagrams are truncated by the OS
pub const MAX_DATAGRAM: usize = 2048;

/// Discovery request broadcast by a device
pub const DISCOVERY_REQUEST: &[u8] = b"DISCOVER_SERVER";

/// Discovery reply unicast by the server
pub const DISCOVERY_RESPONSE: &[u8] = b"SERVER_IP_RESPONSE";

// Byte offsets of each field within the serialised header.
const OFF_VERSION_TYPE: usize = 0;
const OFF_DEVICE_ID: usize = 1;
const OFF_SEQ: usize = 3;
const OFF_TIMESTAMP: usize = 5;
const OFF_FLAGS: usize = 9;

// =============================================================================
// Header Fields
// =============================================================================

/// Message type carried in the low nibble of the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Init = 0,
    Data = 1,
    Heartbeat = 2,
    Config = 3,
}

impl MessageType {
    pub fn from_value(v: u8) -> Result<Self, ParseError> {
        match v {
            0 => Ok(MessageType::Init),
            1 => Ok(MessageType::Data),
            2 => Ok(MessageType::Heartbeat),
            3 => Ok(MessageType::Config),
            _ => Err(ParseError::UnknownMessageType(v)),
        }
    }

    pub fn value(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Init => write!(f, "INIT"),
            MessageType::Data => write!(f, "DATA"),
            MessageType::Heartbeat => write!(f, "HEARTBEAT"),
            MessageType::Config => write!(f, "CONFIG"),
        }
    }
}

bitflags! {
    /// Header flag bits.
    ///
    /// Unknown bits are retained so a decoded packet re-encodes identically.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u8 {
        /// Payload carries several `;`-separated readings under one sequence number
        const BATCH = 0b0000_0100;
    }
}

impl Flags {
    pub fn is_batch(&self) -> bool {
        self.contains(Flags::BATCH)
    }
}

// =============================================================================
// Packet
// =============================================================================

/// A decoded telemetry datagram: header fields plus text payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version (4 bits)
    pub version: u8,
    pub msg_type: MessageType,
    pub device_id: u16,
    /// Sequence number, wraps modulo 65536
    pub seq: u16,
    /// Sender clock in milliseconds, wraps modulo 2^32
    pub timestamp: u32,
    pub flags: Flags,
    pub payload: String,
}

impl Packet {
    /// Create a packet with the current protocol version.
    pub fn new(
        msg_type: MessageType,
        device_id: u16,
        seq: u16,
        timestamp: u32,
        flags: Flags,
        payload: impl Into<String>,
    ) -> Self {
        Packet {
            version: PROTOCOL_VERSION,
            msg_type,
            device_id,
            seq,
            timestamp,
            flags,
            payload: payload.into(),
        }
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// Only the low 4 bits of `version` are kept.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload.as_bytes();
        let mut buf = vec![0u8; HEADER_LEN + payload.len()];

        buf[OFF_VERSION_TYPE] = ((self.version & 0x0F) << 4) | self.msg_type.value();
        buf[OFF_DEVICE_ID..OFF_DEVICE_ID + 2].copy_from_slice(&self.device_id.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_TIMESTAMP..OFF_TIMESTAMP + 4].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[OFF_FLAGS] = self.flags.bits();
        buf[HEADER_LEN..].copy_from_slice(payload);

        buf
    }

    /// Parse a [`Packet`] from a raw datagram.
    ///
    /// Returns [`ParseError::MalformedHeader`] if `buf` is shorter than
    /// [`HEADER_LEN`] and [`ParseError::UnknownMessageType`] for a type nibble
    /// above 3. Invalid UTF-8 in the payload is replaced, never rejected.
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < HEADER_LEN {
            return Err(ParseError::MalformedHeader {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }

        let version_type = buf[OFF_VERSION_TYPE];
        let msg_type = MessageType::from_value(version_type & 0x0F)?;
        let device_id = u16::from_be_bytes([buf[OFF_DEVICE_ID], buf[OFF_DEVICE_ID + 1]]);
        let seq = u16::from_be_bytes([buf[OFF_SEQ], buf[OFF_SEQ + 1]]);
        let timestamp = u32::from_be_bytes([
            buf[OFF_TIMESTAMP],
            buf[OFF_TIMESTAMP + 1],
            buf[OFF_TIMESTAMP + 2],
            buf[OFF_TIMESTAMP + 3],
        ]);
        let flags = Flags::from_bits_retain(buf[OFF_FLAGS]);
        let payload = String::from_utf8_lossy(&buf[HEADER_LEN..]).into_owned();

        Ok(Packet {
            version: version_type >> 4,
            msg_type,
            device_id,
            seq,
            timestamp,
            flags,
            payload,
        })
    }

    /// UTF-8 length of the decoded payload. Differs from the received length
    /// when invalid bytes were replaced during decoding.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Encode a packet from its individual header fields.
#[allow(clippy::too_many_arguments)]
pub fn encode(
    version: u8,
    msg_type: MessageType,
    device_id: u16,
    seq: u16,
    timestamp: u32,
    flags: Flags,
    payload: &str,
) -> Vec<u8> {
    Packet {
        version,
        msg_type,
        device_id,
        seq,
        timestamp,
        flags,
        payload: payload.to_string(),
    }
    .encode()
}

/// Decode a datagram into a [`Packet`].
pub fn decode(buf: &[u8]) -> Result<Packet, ParseError> {
    Packet::decode(buf)
}

// =============================================================================
// Discovery
// =============================================================================

/// Check whether a datagram is the discovery request sentinel
pub fn is_discovery_request(buf: &[u8]) -> bool {
    buf == DISCOVERY_REQUEST
}

/// Check whether a datagram is the discovery response sentinel
pub fn is_discovery_response(buf: &[u8]) -> bool {
    buf == DISCOVERY_RESPONSE
}

/// First-level classification of anything arriving on the server socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Discovery,
    Packet(Packet),
}

impl Inbound {
    pub fn classify(buf: &[u8]) -> Result<Self, ParseError> {
        if is_discovery_request(buf) {
            return Ok(Inbound::Discovery);
        }
        Packet::decode(buf).map(Inbound::Packet)
    }
}

/// Truncate a millisecond clock to the 32-bit wire timestamp
pub fn wire_timestamp(ms: u64) -> u32 {
    (ms & 0xFFFF_FFFF) as u32
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let bytes = encode(
            1,
            MessageType::Data,
            0x1234,
            0xABCD,
            0x0102_0304,
            Flags::BATCH,
            "21.5",
        );
        assert_eq!(bytes.len(), HEADER_LEN + 4);
        assert_eq!(
            &bytes[..HEADER_LEN],
            &[0x11, 0x12, 0x34, 0xAB, 0xCD, 0x01, 0x02, 0x03, 0x04, 0x04]
        );
        assert_eq!(&bytes[HEADER_LEN..], b"21.5");
    }

    #[test]
    fn test_round_trip() {
        let cases = [
            Packet::new(MessageType::Init, 0, 0, 0, Flags::empty(), ""),
            Packet::new(
                MessageType::Data,
                u16::MAX,
                u16::MAX,
                u32::MAX,
                Flags::from_bits_retain(0xFF),
                "20.1;21.2;22.3",
            ),
            Packet {
                version: 0x0F,
                ..Packet::new(MessageType::Config, 1001, 7, 123_456, Flags::empty(), "MODE=batch")
            },
            Packet::new(MessageType::Heartbeat, 42, 65535, 1, Flags::empty(), "°C ✓"),
        ];
        for packet in cases {
            assert_eq!(decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn test_round_trip_header_boundaries() {
        let types = [
            MessageType::Init,
            MessageType::Data,
            MessageType::Heartbeat,
            MessageType::Config,
        ];
        let seqs = [0, 1, 0x7FFF, 0x8000, u16::MAX];
        let timestamps = [0, 1, 0x7FFF_FFFF, 0x8000_0000, u32::MAX];
        let flags = [0x00, Flags::BATCH.bits(), 0xFB, 0xFF];

        for version in 0..16u8 {
            for msg_type in types {
                for seq in seqs {
                    for timestamp in timestamps {
                        for bits in flags {
                            for payload in ["", "x;y"] {
                                let packet = Packet {
                                    version,
                                    ..Packet::new(
                                        msg_type,
                                        seq ^ 0x00FF,
                                        seq,
                                        timestamp,
                                        Flags::from_bits_retain(bits),
                                        payload,
                                    )
                                };
                                let bytes = packet.encode();
                                assert_eq!(bytes[0], version << 4 | msg_type.value());
                                assert_eq!(decode(&bytes).unwrap(), packet);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_short_datagram_is_malformed() {
        for len in 0..HEADER_LEN {
            let buf = vec![0x10; len];
            assert_eq!(
                decode(&buf),
                Err(ParseError::MalformedHeader {
                    expected: HEADER_LEN,
                    actual: len
                })
            );
        }
    }

    #[test]
    fn test_header_only_has_empty_payload() {
        let packet = decode(&[0x12, 0, 1, 0, 2, 0, 0, 0, 3, 0]).unwrap();
        assert_eq!(packet.msg_type, MessageType::Heartbeat);
        assert_eq!(packet.device_id, 1);
        assert_eq!(packet.seq, 2);
        assert_eq!(packet.timestamp, 3);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut bytes = Packet::new(MessageType::Data, 1, 1, 1, Flags::empty(), "").encode();
        bytes.extend_from_slice(&[b'2', 0xFF, b'5']);
        let packet = decode(&bytes).unwrap();
        assert_eq!(packet.payload, "2\u{FFFD}5");
    }

    #[test]
    fn test_unknown_message_type() {
        let bytes = [0x1A, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode(&bytes), Err(ParseError::UnknownMessageType(0x0A)));
    }

    #[test]
    fn test_discovery_classification() {
        assert_eq!(Inbound::classify(DISCOVERY_REQUEST), Ok(Inbound::Discovery));
        assert!(!is_discovery_request(DISCOVERY_RESPONSE));
        assert!(is_discovery_response(b"SERVER_IP_RESPONSE"));

        let packet = Packet::new(MessageType::Init, 9, 0, 0, Flags::empty(), "");
        assert_eq!(
            Inbound::classify(&packet.encode()),
            Ok(Inbound::Packet(packet))
        );
    }

    #[test]
    fn test_wire_timestamp_wraps() {
        assert_eq!(wire_timestamp(5), 5);
        assert_eq!(wire_timestamp((1u64 << 32) + 7), 7);
    }
}
