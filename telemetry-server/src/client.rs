//! Simulated sensor device.
//!
//! The client discovers the server by broadcast, announces itself with an
//! Init packet, asks for its reporting mode with a CONFIG request and then
//! runs three subsystems on one shared socket:
//!
//! - **sender**: one reading per tick, sent immediately (single) or
//!   collected into a batch (batch)
//! - **heartbeat**: sends a Heartbeat only when no data went out for a full
//!   interval
//! - **listener**: applies CONFIG replies from the server to the shared mode

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

use telemetry_core::protocol::message::{batch_payload, single_payload};
use telemetry_core::protocol::{
    is_discovery_response, wire_timestamp, Flags, MessageType, Packet, DEFAULT_PORT,
    DISCOVERY_REQUEST, MAX_DATAGRAM,
};
use telemetry_core::{Message, Mode};

use crate::network::{broadcast_addr, create_udp_broadcast};
use crate::{now_ms, TelemetryError};

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Simulated telemetry sensor device")]
pub struct ClientCli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Server UDP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Server address; skips discovery when given
    #[arg(short, long)]
    pub server: Option<IpAddr>,

    /// How long to wait for a discovery response
    #[arg(long, default_value_t = 8000)]
    pub discovery_timeout_ms: u64,

    /// Device identifier
    #[arg(short, long, default_value_t = 1001)]
    pub device_id: u16,

    /// Reporting mode to request (single or batch)
    #[arg(short, long, default_value = "batch")]
    pub mode: Mode,

    /// Interval between readings
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,

    /// Readings per batch packet
    #[arg(long, default_value_t = 5)]
    pub batch_size: usize,

    /// Idle time after which a heartbeat is sent
    #[arg(long, default_value_t = telemetry_core::heartbeat::HEARTBEAT_INTERVAL_MS)]
    pub heartbeat_interval_ms: u64,

    /// Stop after this many Data packets
    #[arg(short, long)]
    pub count: Option<u64>,
}

/// Reporting mode shared between the client's tasks
#[derive(Debug, Default)]
pub struct SharedMode(AtomicU8);

impl SharedMode {
    pub fn new(mode: Mode) -> Self {
        SharedMode(AtomicU8::new(Self::to_u8(mode)))
    }

    pub fn load(&self) -> Mode {
        match self.0.load(Ordering::Acquire) {
            1 => Mode::Single,
            2 => Mode::Batch,
            _ => Mode::Unknown,
        }
    }

    pub fn store(&self, mode: Mode) {
        self.0.store(Self::to_u8(mode), Ordering::Release);
    }

    fn to_u8(mode: Mode) -> u8 {
        match mode {
            Mode::Unknown => 0,
            Mode::Single => 1,
            Mode::Batch => 2,
        }
    }
}

/// Broadcast a discovery request and wait for the server's answer.
///
/// Returns the server address the response came from.
pub async fn discover_server(
    socket: &UdpSocket,
    target: SocketAddr,
    wait: Duration,
) -> Result<SocketAddr, TelemetryError> {
    log::info!("Broadcasting discovery request to {}", target);
    socket.send_to(DISCOVERY_REQUEST, target).await?;

    let mut buf = [0u8; 64];
    let (len, from) = timeout(wait, socket.recv_from(&mut buf))
        .await
        .map_err(|_| TelemetryError::DiscoveryTimeout(wait))??;

    if !is_discovery_response(&buf[..len]) {
        return Err(TelemetryError::InvalidDiscoveryResponse(from));
    }
    log::info!("Discovered server at {}", from);
    Ok(from)
}

/// Uniform reading in [20.0, 30.0) rounded to two decimals
pub fn sample_reading<R: Rng>(rng: &mut R) -> f64 {
    (rng.random_range(20.0..30.0f64) * 100.0).round() / 100.0
}

/// One simulated device talking to one server
pub struct Device {
    id: u16,
    server: SocketAddr,
    socket: Arc<UdpSocket>,
    mode: SharedMode,
    next_seq: AtomicU16,
    last_send_ms: AtomicU64,
}

impl Device {
    pub fn new(id: u16, server: SocketAddr, socket: Arc<UdpSocket>, mode: Mode) -> Self {
        Device {
            id,
            server,
            socket,
            mode: SharedMode::new(mode),
            next_seq: AtomicU16::new(0),
            last_send_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode.load()
    }

    /// Milliseconds since the last datagram went out
    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_send_ms.load(Ordering::Acquire))
    }

    async fn send(
        &self,
        msg_type: MessageType,
        seq: u16,
        flags: Flags,
        payload: String,
    ) -> Result<u16, TelemetryError> {
        let now = now_ms();
        let packet = Packet::new(msg_type, self.id, seq, wire_timestamp(now), flags, payload);
        self.socket.send_to(&packet.encode(), self.server).await?;
        self.last_send_ms.store(now, Ordering::Release);
        log::debug!("Sent {} seq {} ({} bytes payload)", msg_type, seq, packet.payload_len());
        Ok(seq)
    }

    /// Announce the device; restarts the sequence at 0.
    pub async fn send_init(&self) -> Result<u16, TelemetryError> {
        self.next_seq.store(1, Ordering::Release);
        self.send(MessageType::Init, 0, Flags::empty(), String::new())
            .await
    }

    pub async fn request_mode(&self, mode: Mode) -> Result<(), TelemetryError> {
        let seq = self.next_seq.load(Ordering::Acquire);
        self.send(MessageType::Config, seq, Flags::empty(), mode.config_payload())
            .await?;
        Ok(())
    }

    pub async fn send_single(&self, value: f64) -> Result<u16, TelemetryError> {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.send(MessageType::Data, seq, Flags::empty(), single_payload(value))
            .await
    }

    pub async fn send_batch(&self, values: &[f64]) -> Result<u16, TelemetryError> {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.send(MessageType::Data, seq, Flags::BATCH, batch_payload(values))
            .await
    }

    /// Heartbeats repeat the last data sequence number and never consume one.
    pub async fn send_heartbeat(&self) -> Result<u16, TelemetryError> {
        let seq = self.next_seq.load(Ordering::Acquire).wrapping_sub(1);
        self.send(MessageType::Heartbeat, seq, Flags::empty(), String::new())
            .await
    }

    /// Apply a datagram received from the server. Returns the new mode if
    /// it was a CONFIG for this device.
    pub fn handle_inbound(&self, buf: &[u8]) -> Option<Mode> {
        let packet = match Packet::decode(buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Ignoring datagram from server: {}", e);
                return None;
            }
        };
        if packet.device_id != self.id {
            log::debug!("Ignoring {} for device {}", packet.msg_type, packet.device_id);
            return None;
        }
        match Message::from_packet(&packet) {
            Ok(Message::Config { mode }) => {
                let previous = self.mode.load();
                self.mode.store(mode);
                if previous != mode {
                    log::info!("Server switched mode {} -> {}", previous, mode);
                } else {
                    log::info!("Server confirmed mode {}", mode);
                }
                Some(mode)
            }
            Ok(other) => {
                log::debug!("Ignoring {} from server", other.msg_type());
                None
            }
            Err(e) => {
                log::warn!("Invalid CONFIG from server: {}", e);
                None
            }
        }
    }
}

async fn run_sender(
    device: Arc<Device>,
    period: Duration,
    batch_size: usize,
    count: Option<u64>,
    subsys: SubsystemHandle,
) -> Result<(), TelemetryError> {
    let mut rng = StdRng::from_os_rng();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut batch: Vec<f64> = Vec::with_capacity(batch_size);
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = subsys.on_shutdown_requested() => {
                break;
            }
            _ = ticker.tick() => {
                let value = sample_reading(&mut rng);
                match device.mode() {
                    Mode::Batch => {
                        batch.push(value);
                        if batch.len() < batch_size.max(1) {
                            continue;
                        }
                        let seq = device.send_batch(&batch).await?;
                        log::info!("Sent batch seq {} with {} readings", seq, batch.len());
                        batch.clear();
                    }
                    _ => {
                        if !batch.is_empty() {
                            device.send_batch(&batch).await?;
                            batch.clear();
                        }
                        let seq = device.send_single(value).await?;
                        log::info!("Sent reading seq {}: {}", seq, value);
                    }
                }
                sent += 1;
                if count.is_some_and(|c| sent >= c) {
                    log::info!("Sent {} data packets, stopping", sent);
                    subsys.request_shutdown();
                    break;
                }
            }
        }
    }

    if !batch.is_empty() {
        match device.send_batch(&batch).await {
            Ok(seq) => log::info!("Flushed partial batch seq {} with {} readings", seq, batch.len()),
            Err(e) => log::warn!("Failed to flush partial batch: {}", e),
        }
    }
    Ok(())
}

async fn run_heartbeat(
    device: Arc<Device>,
    period: Duration,
    subsys: SubsystemHandle,
) -> Result<(), TelemetryError> {
    let idle_limit = period.as_millis() as u64;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = subsys.on_shutdown_requested() => {
                break;
            }
            _ = ticker.tick() => {
                if device.idle_ms(now_ms()) >= idle_limit {
                    let seq = device.send_heartbeat().await?;
                    log::debug!("Sent heartbeat seq {}", seq);
                }
            }
        }
    }
    Ok(())
}

async fn run_listener(
    device: Arc<Device>,
    socket: Arc<UdpSocket>,
    subsys: SubsystemHandle,
) -> Result<(), TelemetryError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = subsys.on_shutdown_requested() => {
                break;
            }
            r = socket.recv_from(&mut buf) => {
                match r {
                    Ok((len, _)) => {
                        device.handle_inbound(&buf[..len]);
                    }
                    Err(e) => log::debug!("recv_from failed: {}", e),
                }
            }
        }
    }
    Ok(())
}

/// Discover the server, announce the device and run its tasks.
pub async fn run(args: ClientCli, subsys: SubsystemHandle) -> Result<(), TelemetryError> {
    let socket = Arc::new(create_udp_broadcast()?);

    let server = match args.server {
        Some(ip) => SocketAddr::new(ip, args.port),
        None => {
            discover_server(
                &socket,
                broadcast_addr(args.port),
                Duration::from_millis(args.discovery_timeout_ms),
            )
            .await?
        }
    };

    let device = Arc::new(Device::new(args.device_id, server, socket.clone(), args.mode));
    device.send_init().await?;
    log::info!("Device {} registered with {}", device.id(), server);
    device.request_mode(args.mode).await?;

    let period = Duration::from_millis(args.interval_ms.max(1));
    let heartbeat = Duration::from_millis(args.heartbeat_interval_ms.max(1));

    let d = device.clone();
    let batch_size = args.batch_size;
    let count = args.count;
    subsys.start(SubsystemBuilder::new("Sender", move |s| {
        run_sender(d, period, batch_size, count, s)
    }));
    let d = device.clone();
    subsys.start(SubsystemBuilder::new("Heartbeat", move |s| {
        run_heartbeat(d, heartbeat, s)
    }));
    let d = device.clone();
    subsys.start(SubsystemBuilder::new("Listener", move |s| {
        run_listener(d, socket, s)
    }));

    subsys.on_shutdown_requested().await;
    Ok(())
}
