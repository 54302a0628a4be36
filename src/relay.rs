//! Request relay: re-originate an observed request toward its real
//! destination and copy the response back verbatim.

use crate::error::{Error, Result};
use crate::http1::{self, HttpRequest, RelayedResponse};
use crate::server::ConnectionContext;
use http::Method;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;

/// Upstream dial deadline
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// What to do with the client connection after a relayed exchange
pub(crate) enum RelayOutcome {
  KeepAlive,
  Close,
}

/// Relay one request and its response between the hijacked client stream
/// and the origin.
///
/// The wire-form request dump is produced on a parallel task; the relay
/// always joins it before returning so the observer and monitor sink see a
/// completed dump.
pub(crate) async fn relay<W>(
  ctx: &ConnectionContext,
  mut request: HttpRequest,
  client: &mut W,
) -> Result<RelayOutcome>
where
  W: AsyncWrite + Unpin,
{
  request.sanitize();

  let dump_request = request.clone();
  let dump_task = tokio::spawn(async move { dump_request.to_wire() });

  let result = exchange_with_origin(ctx, &request, client).await;

  // Rendezvous with the dump before anything else completes this request.
  let request_dump = match dump_task.await {
    Ok(dump) => dump,
    Err(error) => {
      tracing::warn!("request dump task failed: {}", error);
      Vec::new()
    }
  };

  let response = result?;

  if let Err(error) = ctx.shared.observer.observe(&request, &response).await {
    tracing::warn!("{}", error);
  }

  if ctx.shared.config.monitor {
    monitor_dump(&request_dump, &response);
  }

  if response.must_close() {
    Ok(RelayOutcome::Close)
  } else {
    Ok(RelayOutcome::KeepAlive)
  }
}

/// Dial the origin (plain TCP or TLS depending on interception state),
/// send the request in wire form, read one response, and copy it back.
async fn exchange_with_origin<W>(
  ctx: &ConnectionContext,
  request: &HttpRequest,
  client: &mut W,
) -> Result<RelayedResponse>
where
  W: AsyncWrite + Unpin,
{
  let default_port = if ctx.is_tls_intercepted { 443 } else { 80 };
  let addr = request.host_with_port(default_port);

  if ctx.is_tls_intercepted {
    let tcp = dial(&addr).await?;
    let host = request.host();
    let sni = host.split(':').next().unwrap_or(&host).to_string();
    let server_name = ServerName::try_from(sni)
      .map_err(|_| Error::upstream_dial(format!("invalid server name in {}", addr)))?;
    let upstream = ctx
      .shared
      .upstream_tls
      .connect(server_name, tcp)
      .await
      .map_err(|e| Error::upstream_dial(format!("tls dial to {} error: {}", addr, e)))?;
    exchange(request, upstream, client).await
  } else {
    let upstream = dial(&addr).await?;
    exchange(request, upstream, client).await
  }
}

async fn dial(addr: &str) -> Result<TcpStream> {
  match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
    Ok(Ok(stream)) => Ok(stream),
    Ok(Err(error)) => Err(Error::upstream_dial(format!(
      "dial to {} error: {}",
      addr, error
    ))),
    Err(_) => Err(Error::upstream_dial(format!("dial to {} timed out", addr))),
  }
}

async fn exchange<S, W>(
  request: &HttpRequest,
  upstream: S,
  client: &mut W,
) -> Result<RelayedResponse>
where
  S: AsyncRead + AsyncWrite + Unpin,
  W: AsyncWrite + Unpin,
{
  let (upstream_read, mut upstream_write) = tokio::io::split(upstream);

  upstream_write
    .write_all(&request.to_wire())
    .await
    .map_err(|e| Error::upstream_io(format!("send to server error: {}", e)))?;
  upstream_write
    .flush()
    .await
    .map_err(|e| Error::upstream_io(format!("send to server error: {}", e)))?;

  let mut upstream_reader = BufReader::new(upstream_read);
  let response = http1::read_response(&mut upstream_reader, request.method == Method::HEAD).await?;

  // Past this point the response is streaming; errors are terminal.
  client
    .write_all(&response.head)
    .await
    .map_err(|e| Error::client_io(format!("write to client error: {}", e)))?;
  client
    .write_all(&response.body)
    .await
    .map_err(|e| Error::client_io(format!("write to client error: {}", e)))?;
  client
    .flush()
    .await
    .map_err(|e| Error::client_io(format!("write to client error: {}", e)))?;

  Ok(response)
}

/// Human-readable dump of a relayed exchange for monitor mode
fn monitor_dump(request_dump: &[u8], response: &RelayedResponse) {
  tracing::info!(
    "monitor dump\n--- request ---\n{}--- response ---\n{}[{} body bytes]",
    String::from_utf8_lossy(request_dump),
    String::from_utf8_lossy(&response.head),
    response.body.len()
  );
}
