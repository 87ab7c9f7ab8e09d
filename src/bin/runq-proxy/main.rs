use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use runq::{ProxyConfig, ProxySession};
use tracing::{error, info};

/// Host proxy for a runq micro-VM: sends the boot spec to the guest init and
/// forwards signals until the guest closes the control channel.
#[derive(Parser, Debug)]
#[command(name = "runq-proxy", version, about)]
struct Cli {
    /// Unix socket connected to the guest control channel
    #[arg(long, env = "RUNQ_SOCKET")]
    socket: PathBuf,

    /// Boot spec (JSON)
    #[arg(long, env = "RUNQ_SPEC")]
    spec: PathBuf,

    /// Fail when the guest is silent this long (e.g. "30s", "5m")
    #[arg(long, value_parser = humantime::parse_duration)]
    read_timeout: Option<Duration>,

    /// Do not subscribe to host signals
    #[arg(long)]
    no_signals: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = %e, "runq-proxy failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> runq::Result<()> {
    let config = ProxyConfig::load(&cli.spec)?;
    config.validate()?;

    let stream = tokio::net::UnixStream::connect(&cli.socket).await?;
    info!(socket = %cli.socket.display(), "connected to guest control channel");

    let mut session = ProxySession::new(config).forward_signals(!cli.no_signals);
    if let Some(timeout) = cli.read_timeout {
        session = session.read_timeout(timeout);
    }
    let summary = session.run(stream).await?;
    info!(received = summary.received, "session finished");
    Ok(())
}
