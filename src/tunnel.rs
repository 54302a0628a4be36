//! Opaque byte tunnel through a configured upstream proxy.
//!
//! When `remote_proxy_addr` is set every client connection is spliced
//! through the upstream proxy instead of being intercepted. The proxy
//! opens a CONNECT tunnel to the upstream, acknowledges the client, and
//! then pumps bytes in both directions until the first side finishes.

use crate::error::{Error, Result};
use crate::http1::{self, HttpRequest};
use http::{Method, StatusCode};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Upstream proxy dial deadline
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Exact ACK sent to the client when its CONNECT is forwarded upstream
pub fn connection_established_ack() -> String {
  format!(
    "HTTP/1.1 200 Connection Established\r\nProxy-Agent: gomitmproxy/{}\r\n\r\n",
    crate::VERSION
  )
}

/// Forward a hijacked connection through the upstream proxy at `raddr`.
///
/// The tunnel terminates when the first copy direction completes; the
/// other direction is torn down with it rather than drained.
pub(crate) async fn forward<R, W>(
  mut request: HttpRequest,
  client_reader: &mut R,
  client_writer: &mut W,
  raddr: &str,
) -> Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let upstream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(raddr)).await {
    Ok(Ok(stream)) => stream,
    Ok(Err(error)) => {
      return Err(Error::upstream_dial(format!(
        "dial to {} error: {}",
        raddr, error
      )))
    }
    Err(_) => return Err(Error::upstream_dial(format!("dial to {} timed out", raddr))),
  };
  let (upstream_read, mut upstream_write) = tokio::io::split(upstream);
  let mut upstream_reader = BufReader::new(upstream_read);

  connect_proxy_server(&mut upstream_reader, &mut upstream_write, raddr).await?;

  if request.method == Method::CONNECT {
    client_writer
      .write_all(connection_established_ack().as_bytes())
      .await
      .map_err(|e| Error::client_io(format!("write connect ack error: {}", e)))?;
    client_writer
      .flush()
      .await
      .map_err(|e| Error::client_io(format!("write connect ack error: {}", e)))?;
  } else {
    request.sanitize();
    upstream_write
      .write_all(&request.to_wire())
      .await
      .map_err(|e| Error::upstream_io(format!("send to server error: {}", e)))?;
    upstream_write
      .flush()
      .await
      .map_err(|e| Error::upstream_io(format!("send to server error: {}", e)))?;
  }

  let client_to_upstream = tokio::io::copy(client_reader, &mut upstream_write);
  let upstream_to_client = tokio::io::copy(&mut upstream_reader, client_writer);

  // First direction to finish wins; half-closed peers are not drained.
  tokio::select! {
    result = client_to_upstream => {
      if let Err(error) = result {
        tracing::debug!("client to upstream copy ended: {}", error);
      }
    }
    result = upstream_to_client => {
      if let Err(error) = result {
        tracing::debug!("upstream to client copy ended: {}", error);
      }
    }
  }

  Ok(())
}

/// Open a CONNECT tunnel on the upstream proxy socket, targeting the
/// upstream address itself, and require a 200 before any payload flows.
async fn connect_proxy_server<R, W>(
  upstream_reader: &mut R,
  upstream_write: &mut W,
  raddr: &str,
) -> Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let preamble = format!(
    "CONNECT {raddr} HTTP/1.1\r\nHost: {raddr}\r\nProxy-Connection: keep-alive\r\n\r\n"
  );
  upstream_write
    .write_all(preamble.as_bytes())
    .await
    .map_err(|e| Error::upstream_io(format!("send connect to proxy error: {}", e)))?;
  upstream_write
    .flush()
    .await
    .map_err(|e| Error::upstream_io(format!("send connect to proxy error: {}", e)))?;

  let status = http1::read_status(upstream_reader).await?;
  if status != StatusCode::OK {
    return Err(Error::upstream_io(format!(
      "upstream proxy refused tunnel: {}",
      status
    )));
  }
  Ok(())
}
