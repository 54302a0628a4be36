use clap::Parser;
use gomitmproxy::{MitmProxy, ProxyConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// MITM HTTP/HTTPS proxy with dynamically minted certificates
#[derive(Parser)]
#[command(name = "gomitmproxy", version, about, long_about = None)]
struct Cli {
  /// Address the proxy listens on
  #[arg(short = 'l', long = "addr", default_value = "127.0.0.1:8080")]
  addr: String,

  /// Upstream proxy address; all traffic is forwarded through it
  #[arg(short = 'r', long = "raddr")]
  raddr: Option<String>,

  /// Dump relayed requests and responses to the log
  #[arg(short, long)]
  monitor: bool,

  /// PEM file holding the RSA signing key
  #[arg(long = "key", default_value = "gomitmproxy.key")]
  key_file: PathBuf,

  /// PEM file holding the issuing certificate
  #[arg(long = "cert", default_value = "gomitmproxy.crt")]
  cert_file: PathBuf,

  /// Subject organization of the issuing certificate
  #[arg(long = "org", default_value = "")]
  organization: String,

  /// Subject common name of the issuing certificate
  #[arg(long = "cn", default_value = "")]
  common_name: String,

  /// Skip certificate verification on origin TLS dials
  #[arg(long)]
  insecure_upstream: bool,

  /// Collector URL for the cookie observer
  #[arg(long)]
  collector: Option<String>,

  /// Trigger substring for the cookie observer (repeatable)
  #[arg(long = "trigger")]
  triggers: Vec<String>,
}

#[tokio::main]
async fn main() {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = ProxyConfig {
    listen_addr: cli.addr,
    remote_proxy_addr: cli.raddr,
    monitor: cli.monitor,
    tls_organization: cli.organization,
    tls_common_name: cli.common_name,
    private_key_file: cli.key_file,
    cert_file: cli.cert_file,
    upstream_certs_verification: !cli.insecure_upstream,
    collector_url: cli.collector,
    collector_triggers: cli.triggers,
  };

  let proxy = match MitmProxy::new(config).await {
    Ok(proxy) => proxy,
    Err(error) => {
      tracing::error!("startup failed: {}", error);
      std::process::exit(1);
    }
  };

  if let Err(error) = proxy.run().await {
    tracing::error!("proxy terminated: {}", error);
    std::process::exit(1);
  }
}
