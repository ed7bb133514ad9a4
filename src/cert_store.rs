//! Filesystem persistence for the root CA
//!
//! The CA key and certificate live under `<data_dir>/certificates/` and
//! survive restarts. The certificate bytes served for installation are the
//! exact bytes on disk; reconstructing them from parsed parameters would
//! re-sign the certificate and break already-provisioned devices.

use crate::cert_minter::{generate_root_ca, RootCa};
use anyhow::{anyhow, Context, Result};
use rcgen::{CertificateParams, KeyPair};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const CA_CERT_FILE: &str = "rootCA.crt";
const CA_KEY_FILE: &str = "rootCA.key";

/// A CA this close to expiry is replaced at load.
const MIN_REMAINING: Duration = Duration::days(30);

pub struct CertStore {
    cert_dir: PathBuf,
    ca: Arc<RootCa>,
}

impl CertStore {
    /// Load the root CA from disk, generating and persisting a fresh one if
    /// the files are missing or the certificate has fewer than 30 days of
    /// validity left.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let cert_dir = data_dir.as_ref().join("certificates");
        fs::create_dir_all(&cert_dir).context("Failed to create certificate directory")?;

        let cert_path = cert_dir.join(CA_CERT_FILE);
        let key_path = cert_dir.join(CA_KEY_FILE);

        let ca = if cert_path.exists() && key_path.exists() {
            match Self::load_ca(&cert_path, &key_path)? {
                Some(ca) => {
                    tracing::info!("Loaded root CA from {:?}", cert_path);
                    ca
                }
                None => {
                    tracing::warn!("Root CA expires within 30 days, generating a replacement");
                    let ca = generate_root_ca()?;
                    Self::save_ca(&ca, &cert_path, &key_path)?;
                    ca
                }
            }
        } else {
            tracing::info!("Generating new root CA");
            let ca = generate_root_ca()?;
            Self::save_ca(&ca, &cert_path, &key_path)?;

            tracing::info!("Root CA saved to {:?}", cert_path);
            tracing::warn!("Install the root CA certificate on client devices to intercept HTTPS");

            ca
        };

        Ok(Self {
            cert_dir,
            ca: Arc::new(ca),
        })
    }

    /// The loaded signing identity, shared with the minter.
    pub fn ca(&self) -> Arc<RootCa> {
        self.ca.clone()
    }

    /// The CA certificate in PEM form, as installed by desktop clients.
    pub fn ca_pem(&self) -> Vec<u8> {
        self.ca.pem().as_bytes().to_vec()
    }

    /// The CA certificate in DER form, as installed by mobile clients.
    pub fn ca_der(&self) -> Vec<u8> {
        self.ca.der().as_ref().to_vec()
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    /// Load and validate the persisted CA. Returns `None` when the
    /// certificate is within the replacement window.
    fn load_ca(cert_path: &Path, key_path: &Path) -> Result<Option<RootCa>> {
        let cert_pem = fs::read_to_string(cert_path).context("Failed to read CA certificate")?;
        let key_pem = fs::read_to_string(key_path).context("Failed to read CA private key")?;

        let key = KeyPair::from_pem(&key_pem).context("Failed to parse CA private key")?;

        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .context("Failed to parse CA certificate PEM")?;
        if params.not_after - OffsetDateTime::now_utc() < MIN_REMAINING {
            return Ok(None);
        }

        // The DER handed to clients must be the installed bytes, so parse it
        // from the file rather than re-serializing.
        let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| anyhow!("No certificate found in {:?}", cert_path))?
            .context("Failed to decode CA certificate PEM")?;

        // Reconstructed solely as a signing handle; see rcgen#268.
        let cert = params
            .self_signed(&key)
            .context("Failed to reconstruct CA certificate")?;

        Ok(Some(RootCa::new(cert, key, der, cert_pem)))
    }

    /// Persist both CA files atomically (`.tmp` + rename), key mode 0600.
    fn save_ca(ca: &RootCa, cert_path: &Path, key_path: &Path) -> Result<()> {
        Self::write_atomic(cert_path, ca.pem().as_bytes(), false)?;
        Self::write_atomic(key_path, ca.key_pem().as_bytes(), true)?;
        Ok(())
    }

    fn write_atomic(path: &Path, bytes: &[u8], private: bool) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Invalid certificate path {:?}", path))?;
        let tmp = path.with_file_name(format!("{file_name}.tmp"));

        fs::write(&tmp, bytes).with_context(|| format!("Failed to write {tmp:?}"))?;

        #[cfg(unix)]
        if private {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
                .context("Failed to set CA key permissions")?;
        }
        #[cfg(not(unix))]
        {
            let _ = private;
        }

        fs::rename(&tmp, path).with_context(|| format!("Failed to move {tmp:?} into place"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_ca_files() {
        let dir = TempDir::new().unwrap();
        let store = CertStore::open(dir.path()).unwrap();

        let cert_path = dir.path().join("certificates").join(CA_CERT_FILE);
        let key_path = dir.path().join("certificates").join(CA_KEY_FILE);
        assert!(cert_path.exists());
        assert!(key_path.exists());

        let pem = String::from_utf8(store.ca_pem()).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert!(!store.ca_der().is_empty());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn reopen_loads_identical_ca() {
        let dir = TempDir::new().unwrap();

        let first = CertStore::open(dir.path()).unwrap();
        let first_der = first.ca_der();
        let first_key = first.ca().key_pem();
        drop(first);

        let second = CertStore::open(dir.path()).unwrap();
        assert_eq!(second.ca_der(), first_der);
        assert_eq!(second.ca().key_pem(), first_key);
    }

    #[test]
    fn der_matches_installed_file_bytes() {
        let dir = TempDir::new().unwrap();
        let store = CertStore::open(dir.path()).unwrap();
        drop(store);

        // A reloaded store must hand out exactly the bytes a device already
        // installed from disk.
        let reopened = CertStore::open(dir.path()).unwrap();
        let pem_on_disk =
            fs::read_to_string(dir.path().join("certificates").join(CA_CERT_FILE)).unwrap();
        let der_on_disk = rustls_pemfile::certs(&mut pem_on_disk.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(reopened.ca_der(), der_on_disk.as_ref());
    }

    #[test]
    fn nearly_expired_ca_is_replaced() {
        let dir = TempDir::new().unwrap();
        let cert_dir = dir.path().join("certificates");
        fs::create_dir_all(&cert_dir).unwrap();

        // Plant a CA with only five days of validity left.
        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(300);
        params.not_after = now + Duration::days(5);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let cert_path = cert_dir.join(CA_CERT_FILE);
        let key_path = cert_dir.join(CA_KEY_FILE);
        fs::write(&cert_path, cert.pem()).unwrap();
        fs::write(&key_path, key.serialize_pem()).unwrap();

        let store = CertStore::open(dir.path()).unwrap();
        assert_ne!(store.ca_pem(), cert.pem().as_bytes());

        let replaced = fs::read_to_string(&cert_path).unwrap();
        assert_ne!(replaced, cert.pem());
    }
}
