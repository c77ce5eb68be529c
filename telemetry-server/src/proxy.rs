//! UDP impairment proxy.
//!
//! Forwards datagrams from a listening socket to the server through an
//! [`ImpairmentPipeline`], one datagram at a time. The artificial delay
//! blocks the whole loop, so later datagrams queue behind it.

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio_graceful_shutdown::SubsystemHandle;

use telemetry_core::impairment::{Action, Fault, FaultSource, ImpairmentConfig, ImpairmentPipeline};
use telemetry_core::protocol::MAX_DATAGRAM;

use crate::network::{create_udp_listen, create_udp_send};
use crate::TelemetryError;

#[derive(Parser, Clone, Debug)]
#[command(version, about = "UDP impairment proxy for telemetry testing")]
pub struct ProxyCli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Address to receive device datagrams on
    #[arg(short, long)]
    pub listen: SocketAddr,

    /// Server address to forward to
    #[arg(short, long)]
    pub server: SocketAddr,

    /// Probability of dropping a datagram
    #[arg(long, default_value_t = 0.0)]
    pub loss: f64,

    /// Probability of sending a datagram twice
    #[arg(long, default_value_t = 0.0)]
    pub duplicate: f64,

    /// Probability of swapping a datagram through the reorder slot
    #[arg(long, default_value_t = 0.0)]
    pub reorder: f64,

    /// Delay applied to every datagram that is not dropped
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Seed for reproducible fault decisions
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ProxyCli {
    pub fn impairment(&self) -> ImpairmentConfig {
        ImpairmentConfig {
            loss: self.loss,
            duplicate: self.duplicate,
            reorder: self.reorder,
            delay_ms: self.delay_ms,
        }
    }
}

/// Fault decisions drawn from a pseudo-random generator
pub struct RandomFaults {
    rng: StdRng,
}

impl RandomFaults {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        RandomFaults { rng }
    }
}

impl FaultSource for RandomFaults {
    fn trigger(&mut self, _fault: Fault, probability: f64) -> bool {
        self.rng.random::<f64>() < probability
    }
}

pub struct ImpairmentProxy<F: FaultSource> {
    pipeline: ImpairmentPipeline<F>,
    server: SocketAddr,
}

impl<F: FaultSource> ImpairmentProxy<F> {
    pub fn new(config: ImpairmentConfig, faults: F, server: SocketAddr) -> Result<Self, TelemetryError> {
        Ok(ImpairmentProxy {
            pipeline: ImpairmentPipeline::new(config, faults)?,
            server,
        })
    }

    pub fn pipeline(&self) -> &ImpairmentPipeline<F> {
        &self.pipeline
    }

    /// Run one datagram through every step and forward the result.
    pub async fn forward(&mut self, datagram: Vec<u8>, egress: &UdpSocket) -> Result<Action, TelemetryError> {
        if !self.pipeline.admit() {
            log::debug!("Dropped {} bytes", datagram.len());
            return Ok(Action::Dropped);
        }

        if let Some(delay) = self.pipeline.config().delay() {
            tokio::time::sleep(delay).await;
        }

        let routed = self.pipeline.route(datagram);
        for out in &routed.forward {
            egress.send_to(out, self.server).await?;
        }
        match routed.action {
            Action::Held => log::debug!("Holding datagram for reorder"),
            Action::Swapped => log::debug!("Released held datagram, holding current"),
            Action::Duplicated => log::debug!("Sent 2 copies"),
            _ => log::trace!("Forwarded"),
        }
        Ok(routed.action)
    }

    /// Forward from `ingress` until shutdown is requested.
    pub async fn run(
        mut self,
        ingress: UdpSocket,
        subsys: SubsystemHandle,
    ) -> Result<(), TelemetryError> {
        let egress = create_udp_send(&self.server)?;
        let config = *self.pipeline.config();
        log::info!(
            "Impairment proxy {} -> {}: loss {}, duplicate {}, reorder {}, delay {} ms",
            ingress.local_addr()?,
            self.server,
            config.loss,
            config.duplicate,
            config.reorder,
            config.delay_ms
        );

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    log::info!("Proxy shutdown requested");
                    break;
                }
                r = ingress.recv_from(&mut buf) => {
                    match r {
                        Ok((len, _)) => {
                            if let Err(e) = self.forward(buf[..len].to_vec(), &egress).await {
                                log::warn!("Failed to forward to {}: {}", self.server, e);
                            }
                        }
                        Err(e) => log::debug!("recv_from failed: {}", e),
                    }
                }
            }
        }

        if let Some(held) = self.pipeline.held() {
            log::warn!("Discarding {} byte datagram still held for reorder", held.len());
        }
        match serde_json::to_string(self.pipeline.stats()) {
            Ok(json) => log::info!("Proxy totals: {}", json),
            Err(_) => log::info!("Proxy totals: {:?}", self.pipeline.stats()),
        }
        Ok(())
    }
}

/// Bind the listening socket and run the proxy.
pub async fn run(args: ProxyCli, subsys: SubsystemHandle) -> Result<(), TelemetryError> {
    let proxy = ImpairmentProxy::new(args.impairment(), RandomFaults::new(args.seed), args.server)?;
    let ingress = create_udp_listen(&args.listen)?;
    proxy.run(ingress, subsys).await
}
