//! Member daemon binary

use clap::Parser;
use minivol::{Config, Daemon};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minivold")]
#[command(about = "minivol storage-volume daemon", version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Cluster member name
    #[arg(long)]
    member: Option<String>,

    /// Bind address for the API
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// URL advertised to other members
    #[arg(long)]
    advertise: Option<String>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file, then override with CLI arguments
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(member) = cli.member {
        config.server.member_name = member;
    }
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if let Some(url) = cli.advertise {
        config.server.advertise_url = Some(url);
    }
    if let Some(dir) = cli.data_dir {
        config.server.data_dir = dir;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let daemon = Daemon::open(config)?;
    daemon.serve().await?;
    Ok(())
}
