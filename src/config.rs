//! Configuration for the interception proxy

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address for the proxy listener.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// When false, `CONNECT` becomes an opaque tunnel and nothing inside it
    /// is captured.
    #[serde(default = "default_true")]
    pub enable_https: bool,

    /// Bodies beyond this many bytes are forwarded in full but captured
    /// truncated.
    #[serde(default = "default_capture_body_cap")]
    pub capture_body_cap_bytes: usize,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_upstream_connect_timeout_ms")]
    pub upstream_connect_timeout_ms: u64,

    #[serde(default = "default_upstream_header_timeout_ms")]
    pub upstream_header_timeout_ms: u64,

    /// Per-install directory holding `certificates/` and `data/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            enable_https: true,
            capture_body_cap_bytes: default_capture_body_cap(),
            idle_timeout_ms: default_idle_timeout_ms(),
            upstream_connect_timeout_ms: default_upstream_connect_timeout_ms(),
            upstream_header_timeout_ms: default_upstream_header_timeout_ms(),
            data_dir: default_data_dir(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .context("Failed to read configuration file")?;
        let config: ProxyConfig =
            toml::from_str(&contents).context("Failed to parse configuration file")?;
        Ok(config)
    }

    /// Load configuration from environment variables or use defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("NETLENS_HOST") {
            if let Ok(ip) = addr.parse() {
                config.host = ip;
            }
        }

        if let Ok(port) = std::env::var("NETLENS_PORT") {
            if let Ok(p) = port.parse() {
                config.port = p;
            }
        }

        if let Ok(dir) = std::env::var("NETLENS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config
    }

    /// Directory holding the root CA material.
    pub fn cert_dir(&self) -> PathBuf {
        self.data_dir.join("certificates")
    }

    /// Path of the durable traffic archive.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("data").join("traffic.db")
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path.as_ref(), contents).context("Failed to write configuration file")?;
        Ok(())
    }
}

fn default_host() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_port() -> u16 {
    8888
}

fn default_capture_body_cap() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_upstream_connect_timeout_ms() -> u64 {
    30_000
}

fn default_upstream_header_timeout_ms() -> u64 {
    60_000
}

fn default_data_dir() -> PathBuf {
    // Respect $HOME first (tests/sandbox), fall back to dirs::home_dir()
    let home = std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".netlens")
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8888);
        assert_eq!(config.host.to_string(), "0.0.0.0");
        assert!(config.enable_https);
        assert_eq!(config.capture_body_cap_bytes, 10 * 1024 * 1024);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert_eq!(config.upstream_connect_timeout_ms, 30_000);
        assert_eq!(config.upstream_header_timeout_ms, 60_000);
    }

    #[test]
    fn test_derived_paths() {
        let mut config = ProxyConfig::default();
        config.data_dir = PathBuf::from("/tmp/nl");
        assert_eq!(config.cert_dir(), PathBuf::from("/tmp/nl/certificates"));
        assert_eq!(
            config.store_path(),
            PathBuf::from("/tmp/nl/data/traffic.db")
        );
    }

    #[test]
    fn test_save_and_load_config() {
        let config = ProxyConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = ProxyConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(config.port, loaded.port);
        assert_eq!(config.enable_https, loaded.enable_https);
        assert_eq!(config.capture_body_cap_bytes, loaded.capture_body_cap_bytes);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "port = 9000\nenable_https = false\n").unwrap();

        let config = ProxyConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert!(!config.enable_https);
        assert_eq!(config.idle_timeout_ms, 60_000);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("NETLENS_PORT", "9090");
        let config = ProxyConfig::from_env();
        assert_eq!(config.port, 9090);
        std::env::remove_var("NETLENS_PORT");
    }
}
