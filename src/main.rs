//! NetLens - HTTPS interception proxy with a durable traffic archive
//!
//! Runs the proxy engine in the foreground until interrupted. The captured
//! traffic lands in the SQLite archive under the data directory; UIs and
//! exporters consume it through the library's query API and event bus.
//!
//! ```bash
//! netlens --port 8888
//! # Point client devices at http://<host>:8888 and install the root CA
//! # from the printed download URL.
//! ```

use anyhow::Result;
use clap::Parser;
use netlens::{CertMinter, CertStore, EventBus, ProxyConfig, ProxyEngine, TrafficStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netlens")]
#[command(about = "HTTPS interception proxy with a durable traffic archive", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let mut config = if let Some(path) = cli.config {
        ProxyConfig::from_file(path)?
    } else {
        ProxyConfig::from_env()
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let cert_store = CertStore::open(&config.data_dir)?;
    let minter = Arc::new(CertMinter::new(cert_store.ca()));
    let store = Arc::new(TrafficStore::open(config.store_path())?);
    let bus = EventBus::new();

    let handle = ProxyEngine::new(config, minter, store, bus).start().await?;

    tracing::info!("Proxy ready on {}", handle.local_addr());
    tracing::info!(
        "Root CA download served by the companion page at {}",
        handle.cert_download_url()
    );
    tracing::info!("  export HTTP_PROXY=http://{}", handle.local_addr());
    tracing::info!("  export HTTPS_PROXY=http://{}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.stop().await;

    Ok(())
}
