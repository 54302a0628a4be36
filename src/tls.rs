//! TLS configuration for both sides of an interception.
//!
//! The upstream side uses one shared `ClientConfig` built at startup (the
//! "server TLS template"); the client-facing side derives a per-connection
//! `ServerConfig` that owns the minted certificate chain.

use crate::ca::MintedCert;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio_rustls::rustls::{
  self,
  client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
  pki_types::{CertificateDer, ServerName, UnixTime},
  ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Certificate verifier that accepts any upstream certificate.
///
/// Used when the operator disables upstream verification; the proxy is
/// already the man in the middle, and some deployments intercept origins
/// with broken chains on purpose.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

/// Build the shared upstream TLS template used for all origin dials.
/// The crypto provider backing every TLS config in the process.
///
/// Resolves an already-installed process default if one exists, falling
/// back to the compiled-in aws-lc-rs provider; the convenience builders
/// panic when no default was installed.
pub(crate) fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
  rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

pub fn upstream_client_config(certs_verification: bool) -> Result<Arc<ClientConfig>> {
  let builder = ClientConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls(format!("invalid TLS protocol versions: {}", e)))?;
  let config = if certs_verification {
    let mut root_cert_store = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs().certs;
    for cert in certs {
      root_cert_store
        .add(cert)
        .map_err(|e| Error::tls(format!("unable to add native root: {}", e)))?;
    }
    builder
      .with_root_certificates(root_cert_store)
      .with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  Ok(Arc::new(config))
}

/// TLS connector over the shared upstream template
pub fn upstream_connector(config: Arc<ClientConfig>) -> TlsConnector {
  TlsConnector::from(config)
}

/// Derive the per-connection server-side TLS session for a minted leaf.
///
/// Each connection owns its certificate list; cipher and protocol defaults
/// come from the shared crypto provider.
pub fn acceptor_for(minted: &MintedCert) -> Result<TlsAcceptor> {
  let config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls(format!("invalid TLS protocol versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(minted.chain.clone(), minted.private_key()?)
    .map_err(|e| Error::tls(format!("unable to build server TLS config: {}", e)))?;
  Ok(TlsAcceptor::from(Arc::new(config)))
}
