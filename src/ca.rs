//! Issuing-CA lifecycle and per-hostname leaf certificate minting.
//!
//! The signing keypair and issuing certificate are loaded from (or
//! persisted to) PEM files at startup and are read-only afterwards. Leaf
//! certificates are minted on demand per host, signed by the issuing
//! certificate, and memoized with single-flight semantics so concurrent
//! handshakes for one host trigger exactly one signing operation.

use crate::error::{Error, Result};
use crate::proxy::ProxyConfig;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Issuing certificate validity when (re)generated (1 year)
const CA_VALIDITY: Duration = Duration::days(365);
/// Minimum remaining issuing-cert validity accepted at load time (1 month)
const CA_MIN_REMAINING: Duration = Duration::days(30);
/// Leaf certificate validity (2 weeks)
const LEAF_TTL: Duration = Duration::days(14);
/// Cache time-to-live: leaf validity minus a 1-day safety margin, so a
/// cached entry is never served within 1 day of its own expiry
const CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(13 * 24 * 60 * 60);
/// Offset for not_before timestamps to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// Long-lived signing key and issuing certificate.
///
/// Built once at startup; shared read-only by the leaf minter.
pub struct CertificateAuthority {
  /// Issuer handle used to sign leaves
  issuer: Issuer<'static, KeyPair>,
  /// Issuing certificate in DER form, appended to every served chain
  ca_cert_der: CertificateDer<'static>,
  /// Issuing certificate in PEM form, for operator export
  ca_cert_pem: String,
  /// Signing key PEM, reparsed per mint for the leaf public key
  key_pem: String,
  /// Signing key PKCS#8 DER, paired with every minted leaf
  key_der: Vec<u8>,
  /// Subject organization copied onto every leaf
  organization: String,
}

impl CertificateAuthority {
  /// Load the signing key and issuing certificate from the configured PEM
  /// paths, generating and persisting either when missing, unreadable, or
  /// (for the certificate) expiring within one month.
  pub async fn load_or_create(config: &ProxyConfig) -> Result<Self> {
    let organization = config.organization();
    let common_name = config.common_name();

    let (key_pem, key_der, key_generated) = match load_signing_key(&config.private_key_file).await
    {
      Ok(loaded) => (loaded.0, loaded.1, false),
      Err(error) => {
        tracing::debug!(
          "signing key not loadable from {}: {}, generating",
          config.private_key_file.display(),
          error
        );
        let key = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
          .map_err(|e| Error::key_gen(format!("unable to generate RSA key: {}", e)))?;
        let pem = key.serialize_pem();
        persist_pem(&config.private_key_file, pem.as_bytes(), 0o600).await?;
        (pem, key.serialize_der(), true)
      }
    };

    // A freshly generated key invalidates any persisted certificate: its
    // public half no longer matches.
    let loaded_cert = if key_generated {
      Err(Error::CertSign("signing key regenerated".to_string()))
    } else {
      load_issuing_cert(&config.cert_file, &key_pem).await
    };

    let (issuer, ca_cert_der, ca_cert_pem) = match loaded_cert {
      Ok(ca) => ca,
      Err(error) => {
        tracing::debug!(
          "issuing certificate not usable from {}: {}, self-signing",
          config.cert_file.display(),
          error
        );
        let ca = generate_issuing_cert(&key_pem, &organization, &common_name)?;
        persist_pem(&config.cert_file, ca.2.as_bytes(), 0o644).await?;
        ca
      }
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      key_pem,
      key_der,
      organization,
    })
  }

  /// Mint a non-CA leaf for `host`, signed by the issuing certificate.
  ///
  /// The leaf carries the shared signing key as its keypair, so the
  /// returned material pairs directly with [`CertificateAuthority::key_der`].
  fn mint_leaf(&self, host: &str) -> Result<MintedCert> {
    let leaf_key = KeyPair::from_pem(&self.key_pem)
      .map_err(|e| Error::keypair_parse(format!("unable to reparse signing key: {}", e)))?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, self.organization.clone());
    params.distinguished_name = dn;

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    // Modern clients validate against SAN, not CN. IP literals get an
    // iPAddress entry plus a textual dNSName fallback for lenient stacks.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::cert_mint(format!("invalid host name: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + LEAF_TTL;
    let not_after = params.not_after;

    let cert = params
      .signed_by(&leaf_key, &self.issuer)
      .map_err(|e| Error::cert_sign(format!("unable to issue certificate for {}: {}", host, e)))?;

    Ok(MintedCert {
      chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      key_der: self.key_der.clone(),
      not_after,
    })
  }

  /// Issuing certificate in PEM form, for installation in client trust stores
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Issuing certificate in DER form
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }
}

/// A minted leaf bundled with the shared signing key.
pub struct MintedCert {
  /// Served chain: `[leaf, issuing-CA]`
  pub chain: Vec<CertificateDer<'static>>,
  key_der: Vec<u8>,
  /// Leaf expiry
  pub not_after: OffsetDateTime,
}

impl MintedCert {
  /// The private key paired with the leaf, as rustls key material
  pub fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::try_from(self.key_der.clone())
      .map_err(|e| Error::keypair_parse(format!("unable to parse keypair for tls: {}", e)))
  }
}

/// Leaf minter with a single-flight, TTL-bounded cache.
pub struct CertificateStore {
  ca: CertificateAuthority,
  cache: Cache<String, Arc<MintedCert>>,
}

impl CertificateStore {
  pub fn new(ca: CertificateAuthority) -> Self {
    let cache = Cache::builder()
      .max_capacity(1000)
      .time_to_live(CACHE_TTL)
      .build();
    Self { ca, cache }
  }

  /// Return a TLS keypair usable as a server certificate advertising `host`.
  ///
  /// Concurrent callers for one host collapse into a single signing
  /// operation and observe the same minted certificate.
  pub async fn fake_cert_for_name(&self, host: &str) -> Result<Arc<MintedCert>> {
    let name = host.to_string();
    let ca = &self.ca;
    self
      .cache
      .try_get_with(name.clone(), async move { ca.mint_leaf(&name).map(Arc::new) })
      .await
      .map_err(|e| Error::cert_mint(e.to_string()))
  }

  /// Issuing certificate in PEM form
  pub fn ca_cert_pem(&self) -> &str {
    self.ca.ca_cert_pem()
  }

  /// Issuing certificate in DER form
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    self.ca.ca_cert_der()
  }
}

/// Read and parse the signing key PEM, returning (PEM, PKCS#8 DER).
async fn load_signing_key(path: &Path) -> Result<(String, Vec<u8>)> {
  let key_pem = fs::read_to_string(path).await?;
  let key = KeyPair::from_pem(&key_pem)
    .map_err(|e| Error::keypair_parse(format!("unable to parse signing key PEM: {}", e)))?;
  Ok((key_pem, key.serialize_der()))
}

/// Load the issuing certificate and check it stays valid for at least one
/// more month; reject otherwise so the caller regenerates.
async fn load_issuing_cert(
  path: &Path,
  key_pem: &str,
) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
  let cert_pem = fs::read_to_string(path).await?;

  let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
    .next()
    .ok_or_else(|| Error::CertSign("no certificate found in PEM".to_string()))?
    .map_err(|e| Error::CertSign(format!("unable to parse certificate PEM: {}", e)))?;

  let (_, parsed) = x509_parser::parse_x509_certificate(cert_der.as_ref())
    .map_err(|e| Error::CertSign(format!("unable to parse issuing certificate: {}", e)))?;
  let min_not_after = (OffsetDateTime::now_utc() + CA_MIN_REMAINING).unix_timestamp();
  if parsed.validity().not_after.timestamp() < min_not_after {
    return Err(Error::CertSign(
      "issuing certificate expires within one month".to_string(),
    ));
  }

  let key_pair = KeyPair::from_pem(key_pem)
    .map_err(|e| Error::keypair_parse(format!("unable to reparse signing key: {}", e)))?;
  let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
    .map_err(|e| Error::cert_sign(format!("unable to build issuer from CA cert: {}", e)))?;

  Ok((issuer, cert_der, cert_pem))
}

/// Self-sign a fresh issuing certificate bound to the signing key.
fn generate_issuing_cert(
  key_pem: &str,
  organization: &str,
  common_name: &str,
) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
  let key_pair = KeyPair::from_pem(key_pem)
    .map_err(|e| Error::keypair_parse(format!("unable to reparse signing key: {}", e)))?;

  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::OrganizationName, organization);
  dn.push(DnType::CommonName, common_name);
  params.distinguished_name = dn;

  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![
    KeyUsagePurpose::DigitalSignature,
    KeyUsagePurpose::KeyCertSign,
    KeyUsagePurpose::CrlSign,
  ];

  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
  params.not_after = now + CA_VALIDITY;

  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| Error::cert_sign(format!("unable to self-sign issuing certificate: {}", e)))?;
  let cert_pem = cert.pem();
  let cert_der = CertificateDer::from(cert.der().to_vec());

  let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
    .map_err(|e| Error::cert_sign(format!("unable to build issuer from CA cert: {}", e)))?;

  Ok((issuer, cert_der, cert_pem))
}

/// Write a PEM file atomically: temp sibling first, then rename, so a
/// crash mid-write never leaves a truncated key or certificate behind.
async fn persist_pem(path: &Path, data: &[u8], mode: u32) -> Result<()> {
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      fs::create_dir_all(parent).await?;
    }
  }

  let mut tmp = path.as_os_str().to_owned();
  tmp.push(".tmp");
  let tmp = std::path::PathBuf::from(tmp);

  let mut options = fs::OpenOptions::new();
  options.write(true).create(true).truncate(true);
  #[cfg(unix)]
  options.mode(mode);
  #[cfg(not(unix))]
  let _ = mode;

  let mut file = options.open(&tmp).await?;
  file.write_all(data).await?;
  file.sync_all().await?;
  drop(file);

  fs::rename(&tmp, path).await?;
  Ok(())
}
