//! # Telemetry Core
//!
//! Platform-independent protocol and state logic for the UDP telemetry system.
//!
//! This crate contains pure parsing, tracking and state-machine code with
//! **zero I/O dependencies**. Sockets, timers and files live in
//! `telemetry-server`; everything here takes the clock as an argument so it
//! can be tested deterministically.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  telemetry-core (no tokio/async deps)                        │
//! │  ├── protocol/    (10-byte header codec, payload grammar)    │
//! │  ├── device       (per-device state, registry)               │
//! │  ├── tracker      (duplicate / reorder / gap detection)      │
//! │  ├── heartbeat    (liveness state machine)                   │
//! │  ├── negotiation  (single/batch mode CONFIG handling)        │
//! │  ├── event        (records for the event log)                │
//! │  └── impairment   (fault pipeline for the test proxy)        │
//! └──────────────────────────────────────────────────────────────┘
//!                              ▲
//!              ┌───────────────┴────────────────┐
//!              │  telemetry-server              │
//!              │  (server, client, proxy bins)  │
//!              └────────────────────────────────┘
//! ```
//!
//! ## Example: Tracking a Stream
//!
//! ```rust
//! use telemetry_core::{DeviceRegistry, Flags};
//!
//! let mut registry = DeviceRegistry::new();
//! let device = registry.get_or_create(1001);
//!
//! assert!(!device.track(1, 100, Flags::empty()).gap);
//! let outcome = device.track(4, 400, Flags::empty());
//! assert!(outcome.gap);
//! assert_eq!(device.gap_count, 2);
//! assert!(device.track(4, 400, Flags::empty()).duplicate);
//! ```
//!
//! ## Example: Decoding a Datagram
//!
//! ```rust
//! use telemetry_core::protocol::{self, MessageType};
//! use telemetry_core::Flags;
//!
//! let bytes = protocol::encode(1, MessageType::Data, 1001, 7, 5000, Flags::empty(), "21.5");
//! let packet = protocol::decode(&bytes).unwrap();
//! assert_eq!(packet.msg_type, MessageType::Data);
//! assert_eq!(packet.payload, "21.5");
//! ```

pub mod device;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod impairment;
pub mod negotiation;
pub mod protocol;
pub mod tracker;

// Re-export commonly used types
pub use device::{DeviceRegistry, DeviceState, DeviceSummary};
pub use error::{ImpairmentError, NegotiationError, ParseError};
pub use event::{EventRecord, EventSink};
pub use heartbeat::{HeartbeatEvent, HeartbeatMonitor, HeartbeatSettings, LivenessState};
pub use impairment::{FaultSource, ImpairmentConfig, ImpairmentPipeline};
pub use negotiation::ConfigReply;
pub use protocol::message::{Message, Mode, Reading};
pub use protocol::{Flags, Inbound, MessageType, Packet};
pub use tracker::TrackOutcome;
