use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::time::Duration;
use telemetry_server::{init_logging, server, Cli, VERSION};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging(&args.verbose);
    log::info!("telemetry-server {}", VERSION);

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("Server", |s| server::run(args, s)));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .into_diagnostic()
}
