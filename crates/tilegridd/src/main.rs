//! tilegridd binary entry point.
//!
//! # Usage
//!
//! ```text
//! tilegridd --config /etc/tilegrid/tilegrid.toml --port 6100
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use tilegrid_core::TileGridConfig;

#[derive(Parser)]
#[command(name = "tilegridd", about = "TileGrid pipeline scheduling daemon")]
struct Cli {
    /// Path to tilegrid.toml. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for persistent state (overrides the config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Ingress port (overrides the config file).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TileGridConfig::from_file(path)?,
        None => TileGridConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.store.data_dir = data_dir;
    }
    if let Some(port) = cli.port {
        config.ingress.port = port;
    }

    tilegridd::daemon::init_tracing(&config.log)?;
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "configuration loaded");
    }

    tilegridd::daemon::run(config).await
}
