//! Typed view of a packet's payload.
//!
//! The payload grammar depends on the message type. It is decoded once, at
//! the dispatch boundary, into a [`Message`] so nothing downstream has to
//! prefix-check text.
//!
//! | Type      | Payload                                   |
//! |-----------|-------------------------------------------|
//! | Init      | ignored                                   |
//! | Data      | `Reading=<v>` or `<v>`; with BATCH flag `<v>;<v>;...` |
//! | Heartbeat | ignored                                   |
//! | Config    | `MODE=single` or `MODE=batch`             |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{MessageType, Packet};
use crate::error::ParseError;

/// Prefix of a CONFIG payload
pub const MODE_PREFIX: &str = "MODE=";

/// Optional prefix of a single reading token
pub const READING_PREFIX: &str = "Reading=";

/// Separator between readings of a batch payload
pub const BATCH_SEPARATOR: char = ';';

// =============================================================================
// Reporting Mode
// =============================================================================

/// Reporting mode of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// No CONFIG exchange has happened yet
    #[default]
    Unknown,
    /// One reading per Data packet
    Single,
    /// Several readings per Data packet
    Batch,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Unknown => "unknown",
            Mode::Single => "single",
            Mode::Batch => "batch",
        }
    }

    /// CONFIG payload announcing this mode
    pub fn config_payload(&self) -> String {
        format!("{}{}", MODE_PREFIX, self.as_str())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ParseError;

    /// Parse a negotiable mode. `unknown` is not negotiable.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Mode::Single),
            "batch" => Ok(Mode::Batch),
            _ => Err(ParseError::InvalidMode(s.trim().to_string())),
        }
    }
}

/// Parse a CONFIG payload of the form `MODE=<value>`.
pub fn parse_mode_request(payload: &str) -> Result<Mode, ParseError> {
    let payload = payload.trim();
    match payload.strip_prefix(MODE_PREFIX) {
        Some(value) => value.parse(),
        None => Err(ParseError::InvalidPayload(format!(
            "expected '{}<mode>', got '{}'",
            MODE_PREFIX, payload
        ))),
    }
}

// =============================================================================
// Readings
// =============================================================================

/// One sensor reading token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    Value(f64),
    /// Token that is not a number; kept verbatim
    Raw(String),
}

impl Reading {
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        let value = token.strip_prefix(READING_PREFIX).unwrap_or(token);
        match value.parse::<f64>() {
            Ok(v) => Reading::Value(v),
            Err(_) => Reading::Raw(token.to_string()),
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Value(v) => Some(*v),
            Reading::Raw(_) => None,
        }
    }
}

/// Format a single-mode Data payload
pub fn single_payload(value: f64) -> String {
    format!("{}{}", READING_PREFIX, value)
}

/// Format a batch-mode Data payload
pub fn batch_payload(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(&BATCH_SEPARATOR.to_string())
}

fn parse_readings(payload: &str, batch: bool) -> Vec<Reading> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Vec::new();
    }
    if batch {
        payload
            .split(BATCH_SEPARATOR)
            .filter(|t| !t.trim().is_empty())
            .map(Reading::parse)
            .collect()
    } else {
        vec![Reading::parse(payload)]
    }
}

// =============================================================================
// Message
// =============================================================================

/// A packet's payload, decoded according to its message type
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Init,
    Data { batch: bool, readings: Vec<Reading> },
    Heartbeat,
    Config { mode: Mode },
}

impl Message {
    /// Decode the payload of `packet`.
    ///
    /// Only CONFIG payloads can fail; Data payloads never reject a packet.
    pub fn from_packet(packet: &Packet) -> Result<Self, ParseError> {
        match packet.msg_type {
            MessageType::Init => Ok(Message::Init),
            MessageType::Heartbeat => Ok(Message::Heartbeat),
            MessageType::Data => {
                let batch = packet.flags.is_batch();
                Ok(Message::Data {
                    batch,
                    readings: parse_readings(&packet.payload, batch),
                })
            }
            MessageType::Config => Ok(Message::Config {
                mode: parse_mode_request(&packet.payload)?,
            }),
        }
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Init => MessageType::Init,
            Message::Data { .. } => MessageType::Data,
            Message::Heartbeat => MessageType::Heartbeat,
            Message::Config { .. } => MessageType::Config,
        }
    }
}
