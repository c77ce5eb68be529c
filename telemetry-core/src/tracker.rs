//! Per-device duplicate, reorder and gap detection.
//!
//! Each tracked packet runs through an ordered set of checks:
//!
//! 1. **Duplicate**: the sequence number was seen before. Duplicates are
//!    recorded and nothing else is evaluated.
//! 2. **Reorder**: the sender timestamp is older than the last accepted one.
//!    Reordered packets never move the baseline.
//! 3. **Gap**: only for packets that are neither duplicate nor reordered,
//!    which then become the new baseline.
//!
//! Batch packets advance the sequence counter by design, so forward jumps
//! under the BATCH flag are not gaps. Only a short backward jump counts.

use serde::Serialize;

use crate::device::DeviceState;
use crate::protocol::Flags;

/// A backward jump shorter than this under the BATCH flag is an anomaly;
/// anything longer is read as a legitimate wraparound.
pub const BATCH_BACKWARD_THRESHOLD: u16 = 30000;

/// Result of tracking one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TrackOutcome {
    pub duplicate: bool,
    pub reordered: bool,
    pub gap: bool,
    /// Amount added to the device's gap count by this packet
    pub missing: u64,
}

impl DeviceState {
    /// Classify a packet and update the tracking state.
    pub fn track(&mut self, seq: u16, timestamp: u32, flags: Flags) -> TrackOutcome {
        let duplicate = !self.received_seqs.insert(seq);
        if duplicate {
            self.duplicate_seqs.insert(seq);
            return TrackOutcome {
                duplicate: true,
                ..Default::default()
            };
        }

        let reordered = matches!(self.last_timestamp, Some(last) if timestamp < last);
        if reordered {
            return TrackOutcome {
                reordered: true,
                ..Default::default()
            };
        }

        let before = self.gap_count;
        let gap = self.detect_gap(seq, flags);
        self.last_seq = Some(seq);
        self.last_timestamp = Some(timestamp);

        TrackOutcome {
            duplicate: false,
            reordered: false,
            gap,
            missing: self.gap_count - before,
        }
    }

    /// Check `seq` against the baseline and add any missing count to
    /// `gap_count`. Returns whether a gap was found.
    pub fn detect_gap(&mut self, seq: u16, flags: Flags) -> bool {
        match self.gap_size(seq, flags) {
            Some(missing) => {
                self.gap_count += missing;
                true
            }
            None => false,
        }
    }

    /// Number of sequence numbers `seq` implies were lost, if any.
    fn gap_size(&self, seq: u16, flags: Flags) -> Option<u64> {
        let last = self.last_seq?;

        if flags.is_batch() {
            if seq <= last && (last - seq) < BATCH_BACKWARD_THRESHOLD {
                return Some(1);
            }
            return None;
        }

        if seq == last.wrapping_add(1) {
            return None;
        }
        if seq > last {
            Some((seq - last - 1) as u64)
        } else {
            Some((u16::MAX - last) as u64 + seq as u64)
        }
    }
}
