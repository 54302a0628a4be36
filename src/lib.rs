//! MITM HTTP/HTTPS Proxy
//!
//! This crate implements a man-in-the-middle proxy: clients configure it
//! as their HTTP proxy, and it observes both plaintext HTTP and
//! TLS-encrypted HTTPS traffic by terminating TLS with server certificates
//! minted on demand and signed by a locally managed issuing CA.
//!
//! # Features
//!
//! - Automatic issuing-CA generation and PEM persistence
//! - Per-hostname leaf certificates, cached with single-flight minting
//! - Transparent CONNECT interception using the rustls backend
//! - Optional forwarding of all traffic through an upstream proxy
//! - Response observation hook with a pluggable collector
//!
//! # Example
//!
//! ```no_run
//! use gomitmproxy::{MitmProxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = ProxyConfig::default();
//!   let proxy = MitmProxy::new(config).await?;
//!   proxy.run().await?;
//!   Ok(())
//! }
//! ```

pub mod ca;
mod error;
pub mod http1;
pub mod observer;
mod proxy;
mod relay;
pub mod server;
mod tls;
pub mod tunnel;

pub use ca::{CertificateAuthority, CertificateStore, MintedCert};
pub use error::{Error, Result};
pub use http1::{HttpRequest, RelayedResponse};
pub use observer::{CookieCollector, NoopObserver, ResponseObserver};
pub use proxy::{MitmProxy, ProxyConfig};
pub use server::INTERCEPT_ACK;
pub use tunnel::connection_established_ack;

/// Crate version, also the wire-visible `Proxy-Agent` version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
