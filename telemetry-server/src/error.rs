use std::io;
use std::time::Duration;

use telemetry_core::{ImpairmentError, NegotiationError, ParseError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("I/O operation failed")]
    Io(#[from] io::Error),
    #[error("Malformed datagram: {0}")]
    Parse(#[from] ParseError),
    #[error("Mode negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("Invalid impairment settings: {0}")]
    Impairment(#[from] ImpairmentError),
    #[error("No discovery response within {0:?}")]
    DiscoveryTimeout(Duration),
    #[error("Unexpected discovery response from {0}")]
    InvalidDiscoveryResponse(std::net::SocketAddr),
    #[error("Cannot open event log '{path}'")]
    EventLog {
        path: String,
        #[source]
        source: io::Error,
    },
}
