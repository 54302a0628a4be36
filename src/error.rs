//! Error types for the MITM proxy

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the proxy.
///
/// `KeyGen` and `CertSign` are fatal at startup; everything else is scoped
/// to a single connection.
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// RSA signing key generation failed
  #[error("key generation error: {0}")]
  KeyGen(String),

  /// Self-signing the issuing certificate failed
  #[error("certificate signing error: {0}")]
  CertSign(String),

  /// Minting a leaf certificate for a host failed
  #[error("certificate mint error: {0}")]
  CertMint(String),

  /// Assembling the minted leaf and signing key into a TLS keypair failed
  #[error("keypair parse error: {0}")]
  KeypairParse(String),

  /// TLS handshake or configuration error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP parsing error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Malformed or oversized request head from the client
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// Dialing the origin or upstream proxy failed
  #[error("upstream dial error: {0}")]
  UpstreamDial(String),

  /// Reading from or writing to the upstream socket failed
  #[error("upstream IO error: {0}")]
  UpstreamIo(String),

  /// Writing the response back to the client failed
  #[error("client IO error: {0}")]
  ClientIo(String),

  /// Response observer failure, never visible to the client
  #[error("observer error: {0}")]
  Observer(String),
}

impl Error {
  /// Create a key generation error and log it
  pub fn key_gen(msg: impl Into<String>) -> Self {
    let error = Error::KeyGen(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate signing error and log it
  pub fn cert_sign(msg: impl Into<String>) -> Self {
    let error = Error::CertSign(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate mint error and log it
  pub fn cert_mint(msg: impl Into<String>) -> Self {
    let error = Error::CertMint(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a keypair parse error and log it
  pub fn keypair_parse(msg: impl Into<String>) -> Self {
    let error = Error::KeypairParse(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an upstream dial error and log it
  pub fn upstream_dial(msg: impl Into<String>) -> Self {
    let error = Error::UpstreamDial(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an upstream IO error and log it
  pub fn upstream_io(msg: impl Into<String>) -> Self {
    let error = Error::UpstreamIo(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a client IO error and log it
  pub fn client_io(msg: impl Into<String>) -> Self {
    let error = Error::ClientIo(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// True when the error is fatal to process startup
  pub fn is_fatal(&self) -> bool {
    matches!(self, Error::KeyGen(_) | Error::CertSign(_))
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}
