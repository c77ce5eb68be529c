//! Error types for protocol parsing and mode negotiation

use thiserror::Error;

/// Errors that can occur when parsing telemetry datagrams
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Datagram is too short to contain the fixed header
    #[error("Malformed header: expected at least {expected} bytes, got {actual}")]
    MalformedHeader { expected: usize, actual: usize },

    /// Message type nibble is not one of Init, Data, Heartbeat or Config
    #[error("Unknown message type: {0:#04X}")]
    UnknownMessageType(u8),

    /// CONFIG payload names a mode other than `single` or `batch`
    #[error("Invalid mode: '{0}'")]
    InvalidMode(String),

    /// Payload does not follow the grammar for its message type
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Errors raised while applying a CONFIG request to a device
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NegotiationError {
    /// No packet has ever been seen from this device
    #[error("Device {0} is not registered")]
    UnknownDevice(u16),

    /// The device exists but no network address has been observed yet
    #[error("No address known for device {0}")]
    UnknownAddress(u16),

    /// Requested mode is not `single` or `batch`
    #[error("Invalid mode: '{0}'")]
    InvalidMode(String),
}

/// Errors in impairment proxy settings
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImpairmentError {
    /// A fault probability outside `[0, 1]`
    #[error("Probability '{name}' must be within 0.0..=1.0, got {value}")]
    InvalidProbability { name: &'static str, value: f64 },
}

impl From<ParseError> for NegotiationError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::InvalidMode(m) => NegotiationError::InvalidMode(m),
            other => NegotiationError::InvalidMode(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ParseError::MalformedHeader {
            expected: 10,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Malformed header: expected at least 10 bytes, got 3"
        );
        assert_eq!(
            ParseError::UnknownMessageType(0x0f).to_string(),
            "Unknown message type: 0x0F"
        );
    }

    #[test]
    fn test_invalid_mode_converts() {
        let err: NegotiationError = ParseError::InvalidMode("turbo".into()).into();
        assert_eq!(err, NegotiationError::InvalidMode("turbo".into()));
    }
}
