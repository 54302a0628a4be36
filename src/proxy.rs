//! Proxy configuration and process entry points.

use crate::ca::{CertificateAuthority, CertificateStore};
use crate::error::Result;
use crate::observer::{CookieCollector, NoopObserver, ResponseObserver};
use crate::server;
use crate::tls;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::TlsConnector;

/// Proxy configuration, read-only after startup.
#[derive(Clone)]
pub struct ProxyConfig {
  /// Address the proxy accepts client connections on
  pub listen_addr: String,
  /// Optional upstream proxy; when set, every connection is forwarded
  /// through it instead of being intercepted
  pub remote_proxy_addr: Option<String>,
  /// Dump relayed requests and responses to the log sink
  pub monitor: bool,
  /// Subject organization of the issuing certificate; empty selects the
  /// built-in default
  pub tls_organization: String,
  /// Subject common name of the issuing certificate; empty selects the
  /// built-in default
  pub tls_common_name: String,
  /// PEM path of the RSA signing key
  pub private_key_file: PathBuf,
  /// PEM path of the issuing certificate
  pub cert_file: PathBuf,
  /// Verify origin certificates on TLS re-origination
  pub upstream_certs_verification: bool,
  /// Collector endpoint for the cookie observer; absent disables it
  pub collector_url: Option<String>,
  /// Trigger substrings for the cookie observer; empty selects defaults
  pub collector_triggers: Vec<String>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:8080".to_string(),
      remote_proxy_addr: None,
      monitor: false,
      tls_organization: String::new(),
      tls_common_name: String::new(),
      private_key_file: PathBuf::from("gomitmproxy.key"),
      cert_file: PathBuf::from("gomitmproxy.crt"),
      upstream_certs_verification: true,
      collector_url: None,
      collector_triggers: Vec::new(),
    }
  }
}

impl ProxyConfig {
  /// Issuing-cert subject organization, with the versioned default
  pub fn organization(&self) -> String {
    if self.tls_organization.is_empty() {
      format!("gomitmproxy{}", crate::VERSION)
    } else {
      self.tls_organization.clone()
    }
  }

  /// Issuing-cert subject common name, with the default
  pub fn common_name(&self) -> String {
    if self.tls_common_name.is_empty() {
      "gomitmproxy".to_string()
    } else {
      self.tls_common_name.clone()
    }
  }
}

/// State shared by every connection task.
pub(crate) struct Shared {
  pub config: ProxyConfig,
  pub cert_store: CertificateStore,
  pub observer: Box<dyn ResponseObserver>,
  pub upstream_tls: TlsConnector,
}

/// The MITM proxy: issuing-CA state plus the accept loop.
pub struct MitmProxy {
  shared: Shared,
}

impl MitmProxy {
  /// Create the proxy and run the issuing-CA startup path: load or
  /// generate the signing key and issuing certificate. Key or certificate
  /// generation failures are fatal and surface to the caller.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    let ca = CertificateAuthority::load_or_create(&config).await?;
    let cert_store = CertificateStore::new(ca);

    let observer: Box<dyn ResponseObserver> = match &config.collector_url {
      Some(url) => Box::new(CookieCollector::new(
        url.clone(),
        config.collector_triggers.clone(),
      )),
      None => Box::new(NoopObserver),
    };

    let upstream_tls = tls::upstream_connector(tls::upstream_client_config(
      config.upstream_certs_verification,
    )?);

    Ok(Self {
      shared: Shared {
        config,
        cert_store,
        observer,
        upstream_tls,
      },
    })
  }

  /// Replace the response observer
  pub fn with_observer(mut self, observer: Box<dyn ResponseObserver>) -> Self {
    self.shared.observer = observer;
    self
  }

  /// Issuing certificate in PEM form, for client trust-store installation
  pub fn ca_cert_pem(&self) -> &str {
    self.shared.cert_store.ca_cert_pem()
  }

  /// Issuing certificate in DER form
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    self.shared.cert_store.ca_cert_der()
  }

  /// Bind the configured listen address and serve until shutdown
  pub async fn run(self) -> Result<()> {
    let addr = self.shared.config.listen_addr.clone();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);
    self.serve(listener).await
  }

  /// Serve client connections from an already-bound listener.
  ///
  /// Each accepted socket is handed to its own task; the listener never
  /// touches the socket again after hand-off.
  pub async fn serve(self, listener: TcpListener) -> Result<()> {
    let shared = Arc::new(self.shared);
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let shared = shared.clone();
          tokio::spawn(async move {
            if let Err(error) = server::handle_connection(shared, stream).await {
              tracing::error!("error handling connection from {}: {}", peer_addr, error);
            }
          });
        }
        Err(error) => {
          tracing::error!("failed to accept connection: {}", error);
        }
      }
    }
  }
}
