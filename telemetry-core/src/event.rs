//! Event records handed to the external sink.
//!
//! One record is produced per processed Init, Data or Heartbeat packet.
//! The column set and order match what the offline analysis expects.

use std::convert::Infallible;

use serde::Serialize;

use crate::protocol::message::Mode;
use crate::tracker::TrackOutcome;

/// CSV column header, in record field order
pub const CSV_HEADER: &str = "device_id,seq,timestamp,arrival_time,duplicate_flag,gap_flag,reorder_flag,payload_size,is_batch,mode";

/// One processed packet as seen by the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub device_id: u16,
    pub seq: u16,
    /// Unwrapped sender clock (ms)
    pub timestamp: u64,
    /// Server clock at arrival (ms since the Unix epoch)
    pub arrival_time: u64,
    pub duplicate_flag: bool,
    pub gap_flag: bool,
    pub reorder_flag: bool,
    pub payload_size: usize,
    pub is_batch: bool,
    pub mode: Mode,
}

impl EventRecord {
    /// Copy the tracker's verdict into the record's flags
    pub fn with_outcome(mut self, outcome: &TrackOutcome) -> Self {
        self.duplicate_flag = outcome.duplicate;
        self.gap_flag = outcome.gap;
        self.reorder_flag = outcome.reordered;
        self
    }

    /// Format as a CSV row (no trailing newline). Flags are written as 0/1.
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{}",
            self.device_id,
            self.seq,
            self.timestamp,
            self.arrival_time,
            self.duplicate_flag as u8,
            self.gap_flag as u8,
            self.reorder_flag as u8,
            self.payload_size,
            self.is_batch as u8,
            self.mode
        )
    }
}

/// Destination for event records.
///
/// Implemented by the server's append-only log; `Vec<EventRecord>` collects
/// records in memory.
pub trait EventSink {
    type Error;

    fn record(&mut self, event: &EventRecord) -> Result<(), Self::Error>;

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl EventSink for Vec<EventRecord> {
    type Error = Infallible;

    fn record(&mut self, event: &EventRecord) -> Result<(), Self::Error> {
        self.push(event.clone());
        Ok(())
    }
}
