//! # Telemetry Server
//!
//! UDP telemetry server, device simulator and impairment proxy.
//!
//! This crate provides the I/O around [`telemetry_core`]:
//! - Answers discovery broadcasts from devices
//! - Runs the dispatch loop that feeds every datagram through the sequence
//!   tracker, heartbeat monitor and mode negotiation
//! - Appends one record per processed packet to an event log
//! - Simulates a sensor device (`telemetry-client`)
//! - Injects loss, delay, duplication and reordering (`impairment-proxy`)
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐      ┌──────────────────┐      ┌─────────────────────────┐
//!  │ telemetry-   │ UDP  │ impairment-proxy │ UDP  │ telemetry-server        │
//!  │ client       │─────▶│ (optional)       │─────▶│  TelemetryServer::run   │
//!  │  sender      │      └──────────────────┘      │   ├── DeviceRegistry    │
//!  │  heartbeat   │◀─────────── CONFIG ────────────│   ├── HeartbeatMonitor  │
//!  │  listener    │                                │   └── EventLog          │
//!  └──────────────┘                                └─────────────────────────┘
//! ```
//!
//! Each long-running loop is a `tokio-graceful-shutdown` subsystem and
//! observes `on_shutdown_requested()` as its cancellation signal.
//!
//! ## Example: Starting the Server
//!
//! ```rust,no_run
//! use clap::Parser;
//! use telemetry_server::{server, Cli};
//! use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let args = Cli::parse_from(["telemetry-server", "-p", "9000"]);
//!
//!     Toplevel::new(|s| async move {
//!         s.start(SubsystemBuilder::new("Server", |s| server::run(args, s)));
//!     })
//!     .catch_signals()
//!     .handle_shutdown_requests(Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! }
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for the server options, [`client::ClientCli`] and
//! [`proxy::ProxyCli`] for the other binaries.

extern crate tokio;

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

pub mod client;
pub mod error;
pub mod event_log;
pub mod network;
pub mod proxy;
pub mod server;

pub use error::TelemetryError;
pub use event_log::{EventFormat, EventLog};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about = "UDP telemetry collection server")]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// UDP port to listen on
    #[arg(short, long, default_value_t = telemetry_core::protocol::DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Event log file (default: telemetry_log_<timestamp>.csv)
    #[arg(short, long)]
    pub event_log: Option<PathBuf>,

    /// Event log format
    #[arg(long, default_value_t, value_enum)]
    pub event_format: EventFormat,

    /// Expected interval between liveness signals
    #[arg(long, default_value_t = telemetry_core::heartbeat::HEARTBEAT_INTERVAL_MS)]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeat intervals before a device is reported disconnected
    #[arg(long, default_value_t = telemetry_core::heartbeat::MAX_MISSED_HEARTBEATS)]
    pub max_missed_heartbeats: u32,

    /// How often the liveness sweep runs
    #[arg(long, default_value_t = telemetry_core::heartbeat::SWEEP_INTERVAL_MS)]
    pub sweep_interval_ms: u64,
}

/// Wall clock in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Initialise `env_logger` at the level selected on the command line.
pub fn init_logging<L: clap_verbosity_flag::LogLevel>(verbose: &clap_verbosity_flag::Verbosity<L>) {
    env_logger::Builder::new()
        .filter_level(verbose.log_level_filter())
        .format_timestamp_millis()
        .init();
}
