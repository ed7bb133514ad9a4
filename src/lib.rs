//! NetLens core: MITM interception proxy, certificate authority, and
//! durable traffic archive.
//!
//! The pieces compose explicitly; there is no process-wide state:
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use netlens::{CertMinter, CertStore, EventBus, ProxyConfig, ProxyEngine, TrafficStore};
//!
//! let config = ProxyConfig::default();
//! let cert_store = CertStore::open(&config.data_dir)?;
//! let minter = Arc::new(CertMinter::new(cert_store.ca()));
//! let store = Arc::new(TrafficStore::open(config.store_path())?);
//! let bus = EventBus::new();
//!
//! let handle = ProxyEngine::new(config, minter, store, bus).start().await?;
//! println!("proxy on {}", handle.local_addr());
//! # Ok(())
//! # }
//! ```

pub mod cert_minter;
pub mod cert_store;
pub mod config;
pub mod events;
pub mod proxy;
pub mod schema;
pub mod store;

// Re-export commonly used types
pub use cert_minter::{CertMinter, RootCa};
pub use cert_store::CertStore;
pub use config::ProxyConfig;
pub use events::{EventBus, EventStream};
pub use proxy::{ProxyEngine, ProxyHandle};
pub use schema::{ErrorKind, Exchange, ExchangeFilter, ProxyEvent, StatusBucket};
pub use store::TrafficStore;
