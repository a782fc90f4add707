use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use broadcast_relay::{cli::Cli, server::RelayServer, sink::LogSink};

fn init_tracing(sink: LogSink) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(sink),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let sink = LogSink::open(&cli.log_file).context("failed to open log sink")?;
    init_tracing(sink);

    let server = RelayServer::bind(&cli.relay_config()).context("failed to start relay")?;
    let addr = server.local_addr()?;
    info!("relay listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err).context("relay stopped");
    }

    Ok(())
}
