use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::time::Duration;
use telemetry_server::proxy::{self, ProxyCli};
use telemetry_server::{init_logging, VERSION};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ProxyCli::parse();
    init_logging(&args.verbose);
    log::info!("impairment-proxy {}", VERSION);

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("Proxy", |s| proxy::run(args, s)));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(2))
    .await
    .into_diagnostic()
}
