//! Server dispatch loop.
//!
//! One subsystem owns the UDP socket, the [`DeviceRegistry`] and the event
//! sink. Datagrams and liveness sweeps are interleaved on the same task, so
//! a device's state transitions are observed in arrival order without locks.

use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;

use telemetry_core::event::{EventRecord, EventSink};
use telemetry_core::heartbeat::{HeartbeatEvent, HeartbeatMonitor, HeartbeatSettings};
use telemetry_core::negotiation;
use telemetry_core::protocol::{
    Inbound, MessageType, Packet, DISCOVERY_RESPONSE, HEADER_LEN, MAX_DATAGRAM,
};
use telemetry_core::{DeviceRegistry, Message, TrackOutcome};
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::event_log::{default_log_path, EventLog};
use crate::network::create_udp_listen;
use crate::{now_ms, Cli, TelemetryError};

/// A datagram the server wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub to: SocketAddr,
    pub payload: Vec<u8>,
}

pub struct TelemetryServer<S: EventSink> {
    registry: DeviceRegistry,
    monitor: HeartbeatMonitor,
    sink: S,
}

impl<S> TelemetryServer<S>
where
    S: EventSink,
    S::Error: Display,
{
    pub fn new(settings: HeartbeatSettings, sink: S) -> Self {
        TelemetryServer {
            registry: DeviceRegistry::new(),
            monitor: HeartbeatMonitor::new(settings),
            sink,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Process one datagram received from `from` at `now_ms`.
    ///
    /// Never fails: malformed datagrams and rejected requests are logged and
    /// dropped.
    pub fn handle_datagram(&mut self, buf: &[u8], from: SocketAddr, now_ms: u64) -> Option<Reply> {
        match self.process(buf, from, now_ms) {
            Ok(reply) => reply,
            Err(TelemetryError::Negotiation(e)) => {
                log::warn!("Rejected CONFIG from {}: {}", from, e);
                None
            }
            Err(e) => {
                log::warn!("Dropping {} byte datagram from {}: {}", buf.len(), from, e);
                None
            }
        }
    }

    fn process(
        &mut self,
        buf: &[u8],
        from: SocketAddr,
        now_ms: u64,
    ) -> Result<Option<Reply>, TelemetryError> {
        match Inbound::classify(buf)? {
            Inbound::Discovery => {
                log::info!("Discovery request from {}", from);
                Ok(Some(Reply {
                    to: from,
                    payload: DISCOVERY_RESPONSE.to_vec(),
                }))
            }
            Inbound::Packet(packet) => {
                // Bytes as received, not the length after UTF-8 replacement
                let payload_size = buf.len() - HEADER_LEN;
                self.dispatch(packet, payload_size, from, now_ms)
            }
        }
    }

    fn dispatch(
        &mut self,
        packet: Packet,
        payload_size: usize,
        from: SocketAddr,
        now_ms: u64,
    ) -> Result<Option<Reply>, TelemetryError> {
        let device_id = packet.device_id;
        log::trace!(
            "{} from device {} seq {} ts {} ({} bytes) via {}",
            packet.msg_type,
            device_id,
            packet.seq,
            packet.timestamp,
            payload_size,
            from
        );

        let state = self.registry.observe(device_id, from);
        let timestamp = state.unwrap_timestamp(packet.timestamp);
        if let Some(HeartbeatEvent::Reconnected { .. }) = self.monitor.record(device_id, state, now_ms) {
            log::info!("Device {} reconnected", device_id);
        }

        let outcome = match packet.msg_type {
            MessageType::Config => return self.negotiate(&packet, now_ms).map(Some),
            MessageType::Init => {
                state.reset(packet.seq, packet.timestamp);
                log::info!("Device {} initialised at seq {}", device_id, packet.seq);
                TrackOutcome::default()
            }
            MessageType::Heartbeat => {
                log::debug!("Heartbeat from device {}", device_id);
                TrackOutcome::default()
            }
            MessageType::Data => {
                let outcome = state.track(packet.seq, packet.timestamp, packet.flags);
                if outcome.duplicate {
                    log::debug!("Device {} duplicate seq {}", device_id, packet.seq);
                } else if outcome.reordered {
                    log::debug!("Device {} reordered seq {}", device_id, packet.seq);
                } else if outcome.gap {
                    log::debug!(
                        "Device {} gap before seq {}: {} missing, {} total",
                        device_id,
                        packet.seq,
                        outcome.missing,
                        state.gap_count
                    );
                }
                if let Ok(Message::Data { readings, .. }) = Message::from_packet(&packet) {
                    log::trace!("Device {} readings {:?}", device_id, readings);
                }
                outcome
            }
        };

        let record = EventRecord {
            device_id,
            seq: packet.seq,
            timestamp,
            arrival_time: now_ms,
            duplicate_flag: false,
            gap_flag: false,
            reorder_flag: false,
            payload_size,
            is_batch: packet.flags.is_batch(),
            mode: state.mode,
        }
        .with_outcome(&outcome);

        if let Err(e) = self.sink.record(&record) {
            log::error!("Failed to write event for device {}: {}", device_id, e);
        }
        Ok(None)
    }

    fn negotiate(&mut self, packet: &Packet, now_ms: u64) -> Result<Reply, TelemetryError> {
        let reply =
            negotiation::negotiate(&mut self.registry, packet.device_id, &packet.payload, now_ms)?;
        if reply.changed() {
            log::info!(
                "Device {} mode {} -> {}",
                reply.device_id,
                reply.previous,
                reply.mode
            );
        } else {
            log::debug!("Device {} mode confirmed as {}", reply.device_id, reply.mode);
        }
        Ok(Reply {
            to: reply.address,
            payload: reply.encode(),
        })
    }

    /// Run a liveness sweep at `now_ms` and log transitions.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<HeartbeatEvent> {
        let events = self.monitor.sweep(&mut self.registry, now_ms);
        for event in &events {
            if let HeartbeatEvent::Disconnected {
                device_id,
                missed,
                silent_ms,
            } = event
            {
                log::info!(
                    "Device {} disconnected: {} heartbeats missed, silent for {} ms",
                    device_id,
                    missed,
                    silent_ms
                );
            }
        }
        events
    }

    /// Flush the sink and log a summary per device.
    pub fn finish(&mut self) {
        if let Err(e) = self.sink.flush() {
            log::error!("Failed to flush event sink: {}", e);
        }
        for summary in self.registry.summaries() {
            match serde_json::to_string(&summary) {
                Ok(json) => log::info!("Device summary: {}", json),
                Err(_) => log::info!("Device summary: {:?}", summary),
            }
        }
    }

    /// Serve datagrams on `socket` until shutdown is requested.
    pub async fn run(
        mut self,
        socket: UdpSocket,
        sweep_interval: Duration,
        subsys: SubsystemHandle,
    ) -> Result<(), TelemetryError> {
        log::info!("Telemetry server listening on {}", socket.local_addr()?);

        let mut sweep_timer = interval(sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    log::info!("Server shutdown requested");
                    break;
                }
                _ = sweep_timer.tick() => {
                    self.sweep(now_ms());
                }
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            if let Some(reply) = self.handle_datagram(&buf[..len], from, now_ms()) {
                                if let Err(e) = socket.send_to(&reply.payload, reply.to).await {
                                    log::warn!("Failed to send reply to {}: {}", reply.to, e);
                                }
                            }
                        }
                        Err(e) => {
                            // ICMP port unreachable surfaces here on some platforms
                            log::debug!("recv_from failed: {}", e);
                        }
                    }
                }
            }
        }

        self.finish();
        log::info!("Telemetry server stopped");
        Ok(())
    }
}

/// Bind the socket, open the event log and run the server.
pub async fn run(args: Cli, subsys: SubsystemHandle) -> Result<(), TelemetryError> {
    let path = args
        .event_log
        .clone()
        .unwrap_or_else(|| default_log_path(args.event_format));
    let sink = EventLog::open(&path, args.event_format)?;

    let socket = create_udp_listen(&SocketAddr::new(args.bind, args.port))?;
    let settings = HeartbeatSettings {
        interval_ms: args.heartbeat_interval_ms,
        max_missed: args.max_missed_heartbeats,
    };

    TelemetryServer::new(settings, sink)
        .run(
            socket,
            Duration::from_millis(args.sweep_interval_ms.max(1)),
            subsys,
        )
        .await
}
