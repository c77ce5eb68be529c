//! Fault-injection pipeline for the impairment proxy.
//!
//! Real networks drop, delay, duplicate and reorder datagrams. To exercise
//! the sequence tracker under controlled conditions the proxy applies a
//! configurable fault model to every datagram, in a fixed order:
//!
//! | Step      | Description                                              |
//! |-----------|----------------------------------------------------------|
//! | Loss      | Discard with probability `loss`; nothing else happens.   |
//! | Delay     | Wait `delay_ms` before continuing (caller's job).        |
//! | Reorder   | With probability `reorder`, swap through a one-slot hold.|
//! | Duplicate | If not reordered, with probability `duplicate` send two. |
//!
//! Datagrams are opaque bytes; they are never parsed and are forwarded
//! byte-for-byte.
//!
//! A datagram sitting in the hold slot is only released by a later reorder
//! event. If the proxy stops first, that datagram is lost.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ImpairmentError;

/// Probabilities and delay of the fault model
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpairmentConfig {
    pub loss: f64,
    pub duplicate: f64,
    pub reorder: f64,
    pub delay_ms: u64,
}

impl ImpairmentConfig {
    pub fn validate(&self) -> Result<(), ImpairmentError> {
        for (name, value) in [
            ("loss", self.loss),
            ("duplicate", self.duplicate),
            ("reorder", self.reorder),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ImpairmentError::InvalidProbability { name, value });
            }
        }
        Ok(())
    }

    pub fn delay(&self) -> Option<Duration> {
        (self.delay_ms > 0).then(|| Duration::from_millis(self.delay_ms))
    }
}

// =============================================================================
// Fault decisions
// =============================================================================

/// The probabilistic steps of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Loss,
    Reorder,
    Duplicate,
}

/// Source of fault decisions.
///
/// The proxy uses a random source; tests script the decisions.
pub trait FaultSource {
    /// Decide whether `fault` fires for the current datagram.
    fn trigger(&mut self, fault: Fault, probability: f64) -> bool;
}

/// Replays pre-recorded decisions per fault, `false` once exhausted
#[derive(Debug, Clone, Default)]
pub struct ScriptedFaults {
    loss: VecDeque<bool>,
    reorder: VecDeque<bool>,
    duplicate: VecDeque<bool>,
}

impl ScriptedFaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loss(mut self, decisions: &[bool]) -> Self {
        self.loss.extend(decisions);
        self
    }

    pub fn reorder(mut self, decisions: &[bool]) -> Self {
        self.reorder.extend(decisions);
        self
    }

    pub fn duplicate(mut self, decisions: &[bool]) -> Self {
        self.duplicate.extend(decisions);
        self
    }
}

impl FaultSource for ScriptedFaults {
    fn trigger(&mut self, fault: Fault, _probability: f64) -> bool {
        let queue = match fault {
            Fault::Loss => &mut self.loss,
            Fault::Reorder => &mut self.reorder,
            Fault::Duplicate => &mut self.duplicate,
        };
        queue.pop_front().unwrap_or(false)
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// What happened to one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Dropped,
    /// Put in the empty hold slot, nothing forwarded
    Held,
    /// Previously held datagram forwarded, current one now held
    Swapped,
    Duplicated,
    Forwarded,
}

/// Outcome of routing one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub action: Action,
    /// Datagrams to send now, in order
    pub forward: Vec<Vec<u8>>,
}

/// Running totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpairmentStats {
    pub received: u64,
    pub dropped: u64,
    pub held: u64,
    pub swapped: u64,
    pub duplicated: u64,
    pub forwarded: u64,
}

/// The sequential fault pipeline with its one-slot reorder hold
#[derive(Debug)]
pub struct ImpairmentPipeline<F: FaultSource> {
    config: ImpairmentConfig,
    faults: F,
    held: Option<Vec<u8>>,
    stats: ImpairmentStats,
}

impl<F: FaultSource> ImpairmentPipeline<F> {
    pub fn new(config: ImpairmentConfig, faults: F) -> Result<Self, ImpairmentError> {
        config.validate()?;
        Ok(ImpairmentPipeline {
            config,
            faults,
            held: None,
            stats: ImpairmentStats::default(),
        })
    }

    pub fn config(&self) -> &ImpairmentConfig {
        &self.config
    }

    pub fn stats(&self) -> &ImpairmentStats {
        &self.stats
    }

    /// Datagram currently waiting in the hold slot
    pub fn held(&self) -> Option<&[u8]> {
        self.held.as_deref()
    }

    /// Loss step. Returns `false` if the datagram must be discarded.
    pub fn admit(&mut self) -> bool {
        self.stats.received += 1;
        if self.faults.trigger(Fault::Loss, self.config.loss) {
            self.stats.dropped += 1;
            return false;
        }
        true
    }

    /// Reorder and duplicate steps for an admitted datagram.
    pub fn route(&mut self, datagram: Vec<u8>) -> Routed {
        if self.faults.trigger(Fault::Reorder, self.config.reorder) {
            return match self.held.replace(datagram) {
                None => {
                    self.stats.held += 1;
                    Routed {
                        action: Action::Held,
                        forward: Vec::new(),
                    }
                }
                Some(previous) => {
                    self.stats.swapped += 1;
                    self.stats.forwarded += 1;
                    Routed {
                        action: Action::Swapped,
                        forward: vec![previous],
                    }
                }
            };
        }

        if self.faults.trigger(Fault::Duplicate, self.config.duplicate) {
            self.stats.duplicated += 1;
            self.stats.forwarded += 2;
            return Routed {
                action: Action::Duplicated,
                forward: vec![datagram.clone(), datagram],
            };
        }

        self.stats.forwarded += 1;
        Routed {
            action: Action::Forwarded,
            forward: vec![datagram],
        }
    }

    /// Run all steps without delay.
    pub fn process(&mut self, datagram: Vec<u8>) -> Routed {
        if !self.admit() {
            return Routed {
                action: Action::Dropped,
                forward: Vec::new(),
            };
        }
        self.route(datagram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(faults: ScriptedFaults) -> ImpairmentPipeline<ScriptedFaults> {
        ImpairmentPipeline::new(ImpairmentConfig::default(), faults).unwrap()
    }

    #[test]
    fn test_pass_through() {
        let mut p = pipeline(ScriptedFaults::new());
        let routed = p.process(b"abc".to_vec());
        assert_eq!(routed.action, Action::Forwarded);
        assert_eq!(routed.forward, vec![b"abc".to_vec()]);
    }

    #[test]
    fn test_loss_stops_pipeline() {
        // Reorder would fire if reached; it must not be consulted
        let mut p = pipeline(ScriptedFaults::new().loss(&[true]).reorder(&[true]));
        let routed = p.process(b"lost".to_vec());
        assert_eq!(routed.action, Action::Dropped);
        assert!(routed.forward.is_empty());
        assert!(p.held().is_none());

        // The unused reorder decision applies to the next datagram
        assert_eq!(p.process(b"next".to_vec()).action, Action::Held);
        assert_eq!(p.stats().dropped, 1);
    }

    #[test]
    fn test_reorder_swap() {
        let a = vec![0x11, 0x00, 0x01, 0xFF];
        let b = vec![0x11, 0x00, 0x02];
        let mut p = pipeline(ScriptedFaults::new().reorder(&[true, true]));

        let first = p.process(a.clone());
        assert_eq!(first.action, Action::Held);
        assert!(first.forward.is_empty());

        let second = p.process(b.clone());
        assert_eq!(second.action, Action::Swapped);
        assert_eq!(second.forward, vec![a]);
        assert_eq!(p.held(), Some(b.as_slice()));
    }

    #[test]
    fn test_held_waits_for_next_reorder() {
        let a = b"A".to_vec();
        let b = b"B".to_vec();
        let mut p = pipeline(ScriptedFaults::new().reorder(&[true, false]));

        assert!(p.process(a.clone()).forward.is_empty());
        let routed = p.process(b.clone());
        assert_eq!(routed.action, Action::Forwarded);
        assert_eq!(routed.forward, vec![b]);
        assert_eq!(p.held(), Some(a.as_slice()));
    }

    #[test]
    fn test_duplicate() {
        let mut p = pipeline(ScriptedFaults::new().duplicate(&[true]));
        let routed = p.process(b"dup".to_vec());
        assert_eq!(routed.action, Action::Duplicated);
        assert_eq!(routed.forward, vec![b"dup".to_vec(), b"dup".to_vec()]);
        assert_eq!(p.stats().forwarded, 2);
    }

    #[test]
    fn test_reordered_is_not_duplicated() {
        let mut p = pipeline(ScriptedFaults::new().reorder(&[true]).duplicate(&[true]));
        assert_eq!(p.process(b"x".to_vec()).action, Action::Held);
        // Duplicate decision was not consumed by the held datagram
        assert_eq!(p.process(b"y".to_vec()).action, Action::Duplicated);
    }

    #[test]
    fn test_invalid_probability() {
        let config = ImpairmentConfig {
            loss: 1.5,
            ..Default::default()
        };
        assert_eq!(
            ImpairmentPipeline::new(config, ScriptedFaults::new()).unwrap_err(),
            ImpairmentError::InvalidProbability {
                name: "loss",
                value: 1.5
            }
        );
    }

    #[test]
    fn test_delay() {
        assert_eq!(ImpairmentConfig::default().delay(), None);
        let config = ImpairmentConfig {
            delay_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.delay(), Some(Duration::from_millis(250)));
    }
}
