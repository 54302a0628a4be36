//! Per-connection state machine: socket takeover, mode dispatch, and
//! HTTPS interception.
//!
//! The accept loop hands each raw socket to [`handle_connection`]; from
//! that point nothing else touches the stream. Dispatch picks exactly one
//! branch per connection: forward through the configured upstream proxy,
//! intercept a CONNECT with a minted certificate, or relay plain HTTP.

use crate::error::{Error, Result};
use crate::http1::{self, HttpRequest};
use crate::proxy::Shared;
use crate::relay::{self, RelayOutcome};
use crate::tls;
use crate::tunnel;
use http::header::{HeaderValue, HOST};
use http::Method;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Exact acknowledgement written to the client before the intercepting TLS
/// handshake begins
pub const INTERCEPT_ACK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Per-connection state handed through the relay path.
///
/// The TLS-intercepted flag lives here, never on shared state: two
/// connections in different modes must not observe each other's flag.
pub(crate) struct ConnectionContext {
  pub shared: Arc<Shared>,
  pub is_tls_intercepted: bool,
}

/// Drive one hijacked client connection to completion.
pub(crate) async fn handle_connection(shared: Arc<Shared>, stream: TcpStream) -> Result<()> {
  let (read_half, write_half) = tokio::io::split(stream);
  let mut reader = BufReader::new(read_half);
  let mut writer = write_half;

  let mut next = match http1::read_request(&mut reader, "http").await {
    Ok(Some(request)) => Some(request),
    Ok(None) => return Ok(()),
    Err(error) => {
      let msg = format!("unable to read request from client: {}", error);
      let _ = http1::write_bad_gateway(&mut writer, &msg).await;
      return Err(error);
    }
  };

  while let Some(request) = next.take() {
    if let Some(raddr) = shared.config.remote_proxy_addr.clone() {
      return tunnel::forward(request, &mut reader, &mut writer, &raddr).await;
    }

    if request.method == Method::CONNECT {
      return intercept_https(shared, request, reader, writer).await;
    }

    let ctx = ConnectionContext {
      shared: shared.clone(),
      is_tls_intercepted: false,
    };
    match relay::relay(&ctx, request, &mut writer).await {
      Ok(RelayOutcome::KeepAlive) => {}
      Ok(RelayOutcome::Close) => break,
      Err(error) => {
        // The relay may already have streamed bytes; close without a 502.
        tracing::error!("relay error: {}", error);
        break;
      }
    }

    next = match http1::read_request(&mut reader, "http").await {
      Ok(request) => request,
      Err(error) => {
        tracing::debug!("client request read ended: {}", error);
        None
      }
    };
  }

  Ok(())
}

/// Intercept a CONNECT: mint a leaf for the target host, acknowledge the
/// tunnel, terminate TLS, and relay the embedded requests.
async fn intercept_https(
  shared: Arc<Shared>,
  request: HttpRequest,
  reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
  mut writer: tokio::io::WriteHalf<TcpStream>,
) -> Result<()> {
  let authority = request.host();
  let host = authority
    .split(':')
    .next()
    .unwrap_or(authority.as_str())
    .to_string();

  let minted = match shared.cert_store.fake_cert_for_name(&host).await {
    Ok(minted) => minted,
    Err(error) => {
      let msg = format!("could not get mitm cert for name: {}\nerror: {}", host, error);
      let _ = http1::write_bad_gateway(&mut writer, &msg).await;
      return Err(error);
    }
  };
  let acceptor = match tls::acceptor_for(&minted) {
    Ok(acceptor) => acceptor,
    Err(error) => {
      let msg = format!("could not assemble keypair for {}: {}", host, error);
      let _ = http1::write_bad_gateway(&mut writer, &msg).await;
      return Err(error);
    }
  };

  // The client expects a 2xx before it starts its ClientHello; the ACK
  // must hit the wire before any TLS record.
  writer
    .write_all(INTERCEPT_ACK)
    .await
    .map_err(|e| Error::client_io(format!("write intercept ack error: {}", e)))?;
  writer
    .flush()
    .await
    .map_err(|e| Error::client_io(format!("write intercept ack error: {}", e)))?;

  let stream = reader.into_inner().unsplit(writer);
  let tls_stream = acceptor
    .accept(stream)
    .await
    .map_err(|e| Error::tls(format!("TLS handshake with client failed: {}", e)))?;

  let (tls_read, mut tls_write) = tokio::io::split(tls_stream);
  let mut tls_reader = BufReader::new(tls_read);
  let ctx = ConnectionContext {
    shared,
    is_tls_intercepted: true,
  };

  loop {
    let mut inner = match http1::read_request(&mut tls_reader, "https").await {
      Ok(Some(inner)) => inner,
      Ok(None) => break,
      Err(error) => {
        tracing::debug!("intercepted stream ended: {}", error);
        break;
      }
    };
    // Inner requests are origin-form; their authority comes from the Host
    // header, falling back to the CONNECT target.
    if !inner.headers.contains_key(HOST) {
      if let Ok(value) = HeaderValue::from_str(&authority) {
        inner.headers.insert(HOST, value);
      }
    }

    match relay::relay(&ctx, inner, &mut tls_write).await {
      Ok(RelayOutcome::KeepAlive) => {}
      Ok(RelayOutcome::Close) => break,
      Err(error) => {
        tracing::error!("relay error on intercepted connection: {}", error);
        break;
      }
    }
  }

  Ok(())
}
