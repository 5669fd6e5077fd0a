//! Root CA lifecycle and per-host leaf cert minting (spec §3/§4.B).
//!
//! Generates a self-signed root CA on first start, persists it, and
//! mints ephemeral leaf certs on demand. Leaf minting is single-flight
//! per host via `moka`'s `get_with` (P7): concurrent CONNECTs to the
//! same cold host block on one mint instead of racing.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::future::Cache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, Issuer, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tokio::io::AsyncWriteExt;

use crate::error::ProxyError;

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_HOURS: i64 = 24;
const LEAF_CLOCK_SKEW_HOURS: i64 = 1;

/// A minted leaf certificate plus its private key, ready to hand to
/// `rustls::ServerConfig::with_single_cert`.
pub struct CachedLeaf {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// The long-lived self-signed root CA (spec §3 `RootCA`).
pub struct RootCa {
    cert_pem: String,
    issuer: Issuer<'static, KeyPair>,
    leaf_cache: Cache<String, Arc<CachedLeaf>>,
}

impl RootCa {
    /// Load the CA from `cert_path`/`key_path` if both exist, otherwise
    /// generate a new one and persist it. Fatal on any I/O or cert error
    /// (spec §4.B: "Failure to load the CA at startup is fatal").
    pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        if cert_path.exists() && key_path.exists() {
            Self::load(cert_path, key_path).await
        } else {
            Self::generate(cert_path, key_path).await
        }
    }

    async fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let cert_pem = tokio::fs::read_to_string(cert_path).await?;
        let key_pem = tokio::fs::read_to_string(key_path).await?;
        let key_pair = KeyPair::from_pem(&key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;
        tracing::info!(path = %cert_path.display(), "loaded root CA");
        Ok(Self::from_parts(cert_pem, issuer))
    }

    async fn generate(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = cert_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            set_dir_permissions(parent).await?;
        }
        if let Some(parent) = key_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            set_dir_permissions(parent).await?;
        }

        tracing::info!("generating new root CA");

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Sidecar Proxy CA");
        dn.push(DnType::OrganizationName, "Sidecar Proxy");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.serial_number = Some(SerialNumber::from(1u64));
        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(CA_VALIDITY_DAYS);

        let key_pair = KeyPair::generate()?;
        let cert: Certificate = params.self_signed(&key_pair)?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        write_file_owner_only(cert_path, cert_pem.as_bytes()).await?;
        write_file_owner_only(key_path, key_pem.as_bytes()).await?;

        tracing::info!(path = %cert_path.display(), "persisted root CA");

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;
        Ok(Self::from_parts(cert_pem, issuer))
    }

    fn from_parts(cert_pem: String, issuer: Issuer<'static, KeyPair>) -> Self {
        Self {
            cert_pem,
            issuer,
            leaf_cache: Cache::builder().max_capacity(10_000).build(),
        }
    }

    /// PEM-encoded CA certificate, served by the magic-domain handler (spec §4.D).
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Mint (or fetch from cache) a leaf cert for `host`. Single-flight:
    /// concurrent callers for the same cold host share one mint (P7).
    pub async fn leaf_for(&self, host: &str) -> Result<Arc<CachedLeaf>, ProxyError> {
        let host = host.to_string();
        let issuer = &self.issuer;
        self.leaf_cache
            .try_get_with(host.clone(), async move { mint_leaf(&host, issuer) })
            .await
            .map_err(|e: Arc<ProxyError>| ProxyError::Ca(e.to_string()))
    }
}

fn mint_leaf(host: &str, issuer: &Issuer<'static, KeyPair>) -> Result<Arc<CachedLeaf>, ProxyError> {
    let mut subject_alt_names = vec![dns_san(host)?];
    if let Ok(ip) = host.parse::<IpAddr>() {
        subject_alt_names.push(SanType::IpAddress(ip));
    }

    let mut params = CertificateParams::new(vec![host.to_string()])
        .map_err(|e| ProxyError::Ca(format!("invalid hostname {host:?}: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names;
    let not_before = OffsetDateTime::now_utc();
    params.not_before = not_before - Duration::hours(LEAF_CLOCK_SKEW_HOURS);
    params.not_after = not_before + Duration::hours(LEAF_VALIDITY_HOURS);

    let leaf_key = KeyPair::generate().map_err(|e| ProxyError::Ca(e.to_string()))?;
    let leaf_cert = params
        .signed_by(&leaf_key, issuer)
        .map_err(|e| ProxyError::Ca(e.to_string()))?;

    Ok(Arc::new(CachedLeaf {
        cert_der: leaf_cert.der().to_vec(),
        key_der: leaf_key.serialize_der(),
    }))
}

fn dns_san(host: &str) -> Result<SanType, ProxyError> {
    host.to_string()
        .try_into()
        .map(SanType::DnsName)
        .map_err(|e| ProxyError::Ca(format!("invalid SAN for {host:?}: {e}")))
}

#[cfg(unix)]
async fn set_dir_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_dir_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

async fn write_file_owner_only(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

/// Resolve the configured cert/key paths relative to the current directory.
pub fn resolve_paths(cert_path: &str, key_path: &str) -> (PathBuf, PathBuf) {
    (PathBuf::from(cert_path), PathBuf::from(key_path))
}
