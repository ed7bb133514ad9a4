//! On-demand TLS server identities signed by the root CA
//!
//! Leaf certificates are minted per hostname, packaged as rustls server
//! configs, and cached. Concurrent requests for the same hostname coalesce
//! into a single key-generation and signing operation.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;

const CA_COMMON_NAME: &str = "NetLens Root CA";
const CA_ORGANIZATION: &str = "NetLens";
const CA_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// The root signing identity plus the exact DER/PEM bytes clients install.
///
/// The DER is kept separately from the rcgen `Certificate` because
/// reconstructing a certificate from parsed parameters re-signs it; the
/// bytes handed out for installation must stay those on disk.
pub struct RootCa {
    cert: Certificate,
    key: KeyPair,
    der: CertificateDer<'static>,
    pem: String,
}

impl RootCa {
    pub fn new(cert: Certificate, key: KeyPair, der: CertificateDer<'static>, pem: String) -> Self {
        Self {
            cert,
            key,
            der,
            pem,
        }
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }
}

/// Generate a fresh self-signed root CA: RSA-2048, SHA-256, ten years of
/// validity, subject equal to issuer.
pub fn generate_root_ca() -> Result<RootCa> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let key = generate_rsa_keypair().context("Failed to generate CA key pair")?;
    let cert = params
        .self_signed(&key)
        .context("Failed to self-sign CA certificate")?;

    let der = cert.der().clone();
    let pem = cert.pem();

    Ok(RootCa::new(cert, key, der, pem))
}

/// Generate an RSA-2048 key and hand it to rcgen as PKCS#8.
fn generate_rsa_keypair() -> Result<KeyPair> {
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048).context("RSA key generation failed")?;
    let pkcs8 = private_key
        .to_pkcs8_der()
        .context("Failed to encode RSA key as PKCS#8")?;
    let key_pair = KeyPair::try_from(pkcs8.as_bytes()).context("rcgen rejected the RSA key")?;
    Ok(key_pair)
}

/// 128-bit random serial, top bit cleared so the DER integer stays positive.
fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 16] = rand::random();
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

struct CachedLeaf {
    config: Arc<ServerConfig>,
    not_after: OffsetDateTime,
}

/// A freshly issued leaf: certificate, its key, and the validity ceiling.
struct IssuedLeaf {
    cert: Certificate,
    key: KeyPair,
    not_after: OffsetDateTime,
}

/// Mints per-hostname server identities signed by the root CA.
///
/// The cache is keyed by lowercased hostname. A `tokio::sync::OnceCell` per
/// entry makes concurrent misses coalesce: one task mints, the rest await
/// the same result. A failed mint leaves the cell empty.
pub struct CertMinter {
    ca: Arc<RootCa>,
    cache: Mutex<HashMap<String, Arc<OnceCell<CachedLeaf>>>>,
}

impl CertMinter {
    pub fn new(ca: Arc<RootCa>) -> Self {
        Self {
            ca,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Get or mint the rustls server config for a hostname. Expired entries
    /// are evicted and re-minted; a returned config is always valid at the
    /// time of the call.
    pub async fn server_config_for(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        let key = hostname.to_ascii_lowercase();
        loop {
            let cell = {
                let mut cache = self.cache.lock();
                cache
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            };

            let leaf = cell.get_or_try_init(|| self.mint_leaf(&key)).await?;
            if leaf.not_after > OffsetDateTime::now_utc() {
                return Ok(leaf.config.clone());
            }

            tracing::debug!("Leaf certificate for {} expired, re-minting", key);
            let mut cache = self.cache.lock();
            if let Some(current) = cache.get(&key) {
                if Arc::ptr_eq(current, &cell) {
                    cache.remove(&key);
                }
            }
        }
    }

    /// Number of hostnames currently cached.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Drop every cached identity.
    pub fn purge(&self) {
        self.cache.lock().clear();
    }

    async fn mint_leaf(&self, hostname: &str) -> Result<CachedLeaf> {
        tracing::debug!("Minting leaf certificate for {}", hostname);
        let ca = self.ca.clone();
        let hostname = hostname.to_string();
        tokio::task::spawn_blocking(move || {
            let issued = issue_leaf(&ca, &hostname)?;
            into_server_config(&ca, issued)
        })
        .await
        .context("Leaf minting task panicked")?
    }
}

/// Issue a one-year RSA-2048 leaf for `hostname`, signed by the CA.
fn issue_leaf(ca: &RootCa, hostname: &str) -> Result<IssuedLeaf> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    params.subject_alt_names = vec![
        SanType::DnsName(hostname.try_into().context("Hostname is not a valid SAN")?),
        SanType::DnsName(
            format!("*.{hostname}")
                .try_into()
                .context("Wildcard hostname is not a valid SAN")?,
        ),
    ];
    if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(ip)));
    }

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    let not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
    params.not_after = not_after;

    let key =
        generate_rsa_keypair().with_context(|| format!("Failed to generate key for {hostname}"))?;
    let cert = params
        .signed_by(&key, &ca.cert, &ca.key)
        .with_context(|| format!("Failed to sign leaf certificate for {hostname}"))?;

    Ok(IssuedLeaf {
        cert,
        key,
        not_after,
    })
}

/// Package an issued leaf as a rustls server config presenting
/// `[leaf, root]`.
fn into_server_config(ca: &RootCa, issued: IssuedLeaf) -> Result<CachedLeaf> {
    let chain: Vec<CertificateDer<'static>> = vec![issued.cert.der().clone(), ca.der.clone()];
    let key_der = PrivateKeyDer::try_from(issued.key.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize leaf private key: {}", e))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key_der)
        .context("Failed to build TLS server config")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(CachedLeaf {
        config: Arc::new(config),
        not_after: issued.not_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

    fn minter() -> CertMinter {
        CertMinter::new(Arc::new(generate_root_ca().unwrap()))
    }

    fn parse(der: &[u8]) -> X509Certificate<'_> {
        X509Certificate::from_der(der).unwrap().1
    }

    #[test]
    fn root_ca_is_self_signed_ca() {
        let ca = generate_root_ca().unwrap();
        let cert = parse(ca.der().as_ref());

        assert_eq!(cert.subject(), cert.issuer());
        assert!(cert.subject().to_string().contains(CA_COMMON_NAME));

        let bc = cert.basic_constraints().unwrap().unwrap();
        assert!(bc.value.ca);

        let ku = cert.key_usage().unwrap().unwrap();
        assert!(ku.value.key_cert_sign());
        assert!(ku.value.digital_signature());
        assert!(ku.value.crl_sign());
    }

    #[test]
    fn root_ca_validity_spans_ten_years() {
        let ca = generate_root_ca().unwrap();
        let cert = parse(ca.der().as_ref());
        let validity = cert.validity();
        let span = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert!(span >= 3649 * 24 * 3600, "span was {span}");
    }

    #[test]
    fn leaf_issuer_matches_root_subject() {
        let ca = generate_root_ca().unwrap();
        let issued = issue_leaf(&ca, "api.example.test").unwrap();

        let root = parse(ca.der().as_ref());
        let leaf_der = issued.cert.der().as_ref().to_vec();
        let leaf = parse(&leaf_der);

        assert_eq!(leaf.issuer(), root.subject());
        assert!(leaf.validity().is_valid());

        let bc = leaf.basic_constraints().unwrap().unwrap();
        assert!(!bc.value.ca);
    }

    #[test]
    fn leaf_sans_cover_hostname_and_wildcard() {
        let ca = generate_root_ca().unwrap();
        let issued = issue_leaf(&ca, "example.test").unwrap();
        let leaf_der = issued.cert.der().as_ref().to_vec();
        let leaf = parse(&leaf_der);

        let san = leaf.subject_alternative_name().unwrap().unwrap();
        let dns_names: Vec<&str> = san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(*dns),
                _ => None,
            })
            .collect();
        assert!(dns_names.contains(&"example.test"));
        assert!(dns_names.contains(&"*.example.test"));
    }

    #[test]
    fn ipv4_literal_gets_ip_san() {
        let ca = generate_root_ca().unwrap();
        let issued = issue_leaf(&ca, "127.0.0.1").unwrap();
        let leaf_der = issued.cert.der().as_ref().to_vec();
        let leaf = parse(&leaf_der);

        let san = leaf.subject_alternative_name().unwrap().unwrap();
        let has_ip = san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(bytes) if *bytes == [127, 0, 0, 1]));
        assert!(has_ip);
    }

    #[tokio::test]
    async fn concurrent_mints_for_one_hostname_coalesce() {
        let minter = Arc::new(minter());

        let mut handles = Vec::new();
        for _ in 0..100 {
            let minter = minter.clone();
            handles.push(tokio::spawn(async move {
                minter.server_config_for("a.test").await.unwrap()
            }));
        }

        let mut configs = Vec::new();
        for handle in handles {
            configs.push(handle.await.unwrap());
        }

        assert_eq!(minter.cache_len(), 1);
        for config in &configs[1..] {
            assert!(Arc::ptr_eq(&configs[0], config));
        }
    }

    #[tokio::test]
    async fn distinct_hostnames_get_distinct_identities() {
        let minter = minter();
        let a = minter.server_config_for("a.test").await.unwrap();
        let b = minter.server_config_for("b.test").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(minter.cache_len(), 2);

        minter.purge();
        assert_eq!(minter.cache_len(), 0);
    }

    #[tokio::test]
    async fn hostname_lookup_is_case_insensitive() {
        let minter = minter();
        let lower = minter.server_config_for("api.test").await.unwrap();
        let upper = minter.server_config_for("API.TEST").await.unwrap();
        assert!(Arc::ptr_eq(&lower, &upper));
        assert_eq!(minter.cache_len(), 1);
    }
}
