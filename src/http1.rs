//! HTTP/1.1 wire codec for the hijacked connection paths.
//!
//! The proxy never reuses a full HTTP framework on the hijacked socket: it
//! parses request heads itself, re-serializes requests in wire form toward
//! the origin, and copies responses back byte-for-byte. Response body bytes
//! are kept in their original framing (Content-Length, chunked, or
//! read-to-EOF) so the client sees exactly what the origin sent.

use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, COOKIE, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request line cap
const MAX_REQUEST_LINE: usize = 8 * 1024;
/// Header block cap
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// A parsed HTTP/1.1 request from a hijacked client connection.
#[derive(Clone, Debug)]
pub struct HttpRequest {
  pub method: Method,
  /// Request target exactly as received: absolute-form for proxy requests,
  /// origin-form for intercepted inner requests, authority-form for CONNECT
  pub target: String,
  pub version: Version,
  pub headers: HeaderMap,
  pub body: Bytes,
  /// `http` for plaintext requests, `https` once TLS-intercepted
  pub scheme: &'static str,
}

impl HttpRequest {
  /// Authority the request addresses: the `Host` header when present,
  /// otherwise the target's authority component.
  pub fn host(&self) -> String {
    if let Some(host) = self.headers.get(HOST).and_then(|h| h.to_str().ok()) {
      return host.to_string();
    }
    authority_of(&self.target).unwrap_or_else(|| self.target.clone())
  }

  /// Authority with the scheme's default port appended when none is present
  pub fn host_with_port(&self, default_port: u16) -> String {
    let host = self.host();
    if has_port(&host) {
      host
    } else {
      format!("{}:{}", host, default_port)
    }
  }

  /// Absolute URL of the request, for observer trigger matching
  pub fn url(&self) -> String {
    if self.target.starts_with("http://") || self.target.starts_with("https://") {
      self.target.clone()
    } else {
      format!("{}://{}{}", self.scheme, self.host(), self.target)
    }
  }

  /// All `Cookie` header values joined by `;`
  pub fn cookie_values(&self) -> String {
    self
      .headers
      .get_all(COOKIE)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .collect::<Vec<_>>()
      .join(";")
  }

  /// Drop hop-by-hop proxy headers and pin the upstream connection open
  pub fn sanitize(&mut self) {
    self.headers.remove("proxy-connection");
    self
      .headers
      .insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
  }

  /// Origin-form target for the upstream request line
  fn origin_form_target(&self) -> String {
    for scheme_prefix in ["http://", "https://"] {
      if let Some(rest) = self.target.strip_prefix(scheme_prefix) {
        return match rest.find('/') {
          Some(idx) => rest[idx..].to_string(),
          None => "/".to_string(),
        };
      }
    }
    self.target.clone()
  }

  /// Serialize the request in wire form: request line, `Host` first, the
  /// remaining headers, then the body.
  ///
  /// A chunked request body was already decoded at parse time, so the
  /// transfer coding is replaced by an explicit `Content-Length`.
  pub fn to_wire(&self) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + self.body.len());
    buf.extend_from_slice(
      format!("{} {} HTTP/1.1\r\n", self.method, self.origin_form_target()).as_bytes(),
    );
    buf.extend_from_slice(format!("Host: {}\r\n", self.host()).as_bytes());

    let was_chunked = is_chunked(&self.headers);
    for (name, value) in self.headers.iter() {
      if name == HOST || name == TRANSFER_ENCODING {
        continue;
      }
      buf.extend_from_slice(name.as_str().as_bytes());
      buf.extend_from_slice(b": ");
      buf.extend_from_slice(value.as_bytes());
      buf.extend_from_slice(b"\r\n");
    }
    if was_chunked && !self.headers.contains_key(CONTENT_LENGTH) {
      buf.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&self.body);
    buf
  }
}

/// One response as relayed from the origin, bytes preserved verbatim.
pub struct RelayedResponse {
  /// Status line + headers + terminating blank line, exactly as received
  pub head: Vec<u8>,
  /// Body bytes in their original framing
  pub body: Vec<u8>,
  pub status: StatusCode,
  pub headers: HeaderMap,
  close: bool,
}

impl RelayedResponse {
  /// True when the connection cannot be reused after this response, either
  /// because the origin asked to close or because the body was delimited by
  /// EOF.
  pub fn must_close(&self) -> bool {
    self.close
  }
}

/// Read one request off a hijacked (possibly TLS-wrapped) client stream.
///
/// `Ok(None)` means the client closed cleanly before sending another
/// request. CONNECT requests never carry a body.
pub async fn read_request<R>(reader: &mut R, scheme: &'static str) -> Result<Option<HttpRequest>>
where
  R: AsyncBufRead + Unpin,
{
  let mut request_line = Vec::new();
  let n = read_limited_line(reader, &mut request_line, MAX_REQUEST_LINE).await?;
  if n == 0 {
    return Ok(None);
  }

  let line = String::from_utf8_lossy(&request_line);
  let mut parts = line.split_whitespace();
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m, t, v),
    _ => return Err(Error::invalid_request("invalid request line")),
  };
  let method = Method::from_bytes(method.as_bytes())
    .map_err(|_| Error::invalid_request("invalid request method"))?;
  let version = match version {
    "HTTP/1.0" => Version::HTTP_10,
    "HTTP/1.1" => Version::HTTP_11,
    _ => return Err(Error::invalid_request("unsupported HTTP version")),
  };
  let target = target.to_string();

  let headers = read_header_block(reader).await?;

  let body = if method == Method::CONNECT {
    Bytes::new()
  } else {
    read_request_body(reader, &headers).await?
  };

  Ok(Some(HttpRequest {
    method,
    target,
    version,
    headers,
    body,
    scheme,
  }))
}

/// Read exactly one response from the upstream socket, RFC 7230 framing,
/// preserving the raw bytes of both head and body.
pub async fn read_response<R>(reader: &mut R, head_request: bool) -> Result<RelayedResponse>
where
  R: AsyncBufRead + Unpin,
{
  let mut head = Vec::new();
  let mut status_line = Vec::new();
  let n = read_limited_line(reader, &mut status_line, MAX_REQUEST_LINE)
    .await
    .map_err(|e| Error::upstream_io(e.to_string()))?;
  if n == 0 {
    return Err(Error::upstream_io("upstream closed before response"));
  }
  let status = parse_status_line(&status_line)?;
  head.extend_from_slice(&status_line);

  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let n = reader
      .read_until(b'\n', &mut header_line)
      .await
      .map_err(|e| Error::upstream_io(e.to_string()))?;
    if n == 0 {
      return Err(Error::upstream_io("upstream closed inside response head"));
    }
    head.extend_from_slice(&header_line);
    if head.len() > MAX_HEADERS_SIZE {
      return Err(Error::upstream_io("response head exceeds maximum allowed"));
    }
    if header_line == b"\r\n" || header_line == b"\n" {
      break;
    }
    if let Some((name, value)) = parse_header_line(&header_line) {
      headers.append(name, value);
    }
  }

  let mut close = headers
    .get(CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.eq_ignore_ascii_case("close"))
    .unwrap_or(false);

  let mut body = Vec::new();
  let bodyless = head_request
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED;
  if !bodyless {
    if is_chunked(&headers) {
      read_chunked_raw(reader, &mut body).await?;
    } else if let Some(len) = content_length(&headers) {
      body.resize(len, 0);
      reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::upstream_io(e.to_string()))?;
    } else {
      // No framing: the body runs to EOF and the connection dies with it
      reader
        .read_to_end(&mut body)
        .await
        .map_err(|e| Error::upstream_io(e.to_string()))?;
      close = true;
    }
  }

  Ok(RelayedResponse {
    head,
    body,
    status,
    headers,
    close,
  })
}

/// Read a response head and discard it, returning only the status code.
///
/// Used for CONNECT acknowledgements, which carry no body.
pub async fn read_status<R>(reader: &mut R) -> Result<StatusCode>
where
  R: AsyncBufRead + Unpin,
{
  let mut status_line = Vec::new();
  let n = read_limited_line(reader, &mut status_line, MAX_REQUEST_LINE)
    .await
    .map_err(|e| Error::upstream_io(e.to_string()))?;
  if n == 0 {
    return Err(Error::upstream_io("upstream closed before response"));
  }
  let status = parse_status_line(&status_line)?;

  let mut total = status_line.len();
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let n = reader
      .read_until(b'\n', &mut header_line)
      .await
      .map_err(|e| Error::upstream_io(e.to_string()))?;
    if n == 0 {
      return Err(Error::upstream_io("upstream closed inside response head"));
    }
    total += n;
    if total > MAX_HEADERS_SIZE {
      return Err(Error::upstream_io("response head exceeds maximum allowed"));
    }
    if header_line == b"\r\n" || header_line == b"\n" {
      return Ok(status);
    }
  }
}

/// Write a 502 with an explanatory body, for pre-response failures only.
pub async fn write_bad_gateway<W>(writer: &mut W, msg: &str) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  tracing::error!("{}", msg);
  let response = format!(
    "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    msg.len(),
    msg
  );
  writer.write_all(response.as_bytes()).await?;
  writer.flush().await?;
  Ok(())
}

/// Read one line with a byte cap; returns 0 on clean EOF before any bytes.
async fn read_limited_line<R>(reader: &mut R, buf: &mut Vec<u8>, cap: usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let n = reader.read_until(b'\n', buf).await?;
  if n > 0 && !buf.ends_with(b"\n") {
    return Err(Error::invalid_request("truncated line"));
  }
  if buf.len() > cap {
    return Err(Error::invalid_request("line too long"));
  }
  Ok(n)
}

/// Read and parse a header block terminated by a blank line.
async fn read_header_block<R>(reader: &mut R) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut total = 0usize;
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let n = reader.read_until(b'\n', &mut header_line).await?;
    if n == 0 {
      return Err(Error::invalid_request("client closed inside request head"));
    }
    total += n;
    if total > MAX_HEADERS_SIZE {
      return Err(Error::invalid_request("headers size exceeds maximum allowed"));
    }
    if header_line == b"\r\n" || header_line == b"\n" {
      return Ok(headers);
    }
    if let Some((name, value)) = parse_header_line(&header_line) {
      headers.append(name, value);
    }
  }
}

/// Read a request body per its framing; bodies without framing are absent.
async fn read_request_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  if is_chunked(headers) {
    let mut framed = Vec::new();
    read_chunked_raw(reader, &mut framed).await?;
    return Ok(Bytes::from(decode_chunked(&framed)?));
  }
  if let Some(len) = content_length(headers) {
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    return Ok(Bytes::from(body));
  }
  Ok(Bytes::new())
}

/// Copy a chunked body verbatim, including size lines, trailers, and the
/// final CRLF.
async fn read_chunked_raw<R>(reader: &mut R, out: &mut Vec<u8>) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  loop {
    let mut size_line = Vec::new();
    let n = reader
      .read_until(b'\n', &mut size_line)
      .await
      .map_err(|e| Error::upstream_io(e.to_string()))?;
    if n == 0 {
      return Err(Error::upstream_io("unexpected EOF in chunked body"));
    }
    out.extend_from_slice(&size_line);

    let size_text = String::from_utf8_lossy(&size_line);
    let size_text = size_text.trim_end();
    let size_text = size_text.split(';').next().unwrap_or("").trim();
    let size = usize::from_str_radix(size_text, 16)
      .map_err(|_| Error::upstream_io("invalid chunk size"))?;

    if size == 0 {
      // Trailer section runs to the next blank line
      loop {
        let mut trailer = Vec::new();
        let n = reader
          .read_until(b'\n', &mut trailer)
          .await
          .map_err(|e| Error::upstream_io(e.to_string()))?;
        if n == 0 {
          return Err(Error::upstream_io("unexpected EOF in chunk trailers"));
        }
        out.extend_from_slice(&trailer);
        if trailer == b"\r\n" || trailer == b"\n" {
          return Ok(());
        }
      }
    }

    let start = out.len();
    out.resize(start + size + 2, 0);
    reader
      .read_exact(&mut out[start..])
      .await
      .map_err(|e| Error::upstream_io(e.to_string()))?;
  }
}

/// Decode raw chunked framing into the plain payload
fn decode_chunked(framed: &[u8]) -> Result<Vec<u8>> {
  let mut out = Vec::new();
  let mut rest = framed;
  loop {
    let line_end = rest
      .iter()
      .position(|&b| b == b'\n')
      .ok_or_else(|| Error::invalid_request("invalid chunked body"))?;
    let size_text = String::from_utf8_lossy(&rest[..line_end]);
    let size_text = size_text.trim_end();
    let size_text = size_text.split(';').next().unwrap_or("").trim();
    let size = usize::from_str_radix(size_text, 16)
      .map_err(|_| Error::invalid_request("invalid chunk size"))?;
    rest = &rest[line_end + 1..];
    if size == 0 {
      return Ok(out);
    }
    if rest.len() < size {
      return Err(Error::invalid_request("invalid chunked body"));
    }
    out.extend_from_slice(&rest[..size]);
    rest = &rest[size..];
    rest = rest.strip_prefix(b"\r\n").or_else(|| rest.strip_prefix(b"\n")).unwrap_or(rest);
  }
}

fn parse_status_line(line: &[u8]) -> Result<StatusCode> {
  let text = String::from_utf8_lossy(line);
  let mut parts = text.split_whitespace();
  match (parts.next(), parts.next()) {
    (Some(version), Some(code)) if version.starts_with("HTTP/") => code
      .parse::<u16>()
      .ok()
      .and_then(|c| StatusCode::from_u16(c).ok())
      .ok_or_else(|| Error::upstream_io("invalid response status")),
    _ => Err(Error::upstream_io("invalid response status line")),
  }
}

fn parse_header_line(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
  let line = line.strip_suffix(b"\r\n").or_else(|| line.strip_suffix(b"\n")).unwrap_or(line);
  let idx = line.iter().position(|&b| b == b':')?;
  let name = HeaderName::from_bytes(line[..idx].trim_ascii()).ok()?;
  let value = HeaderValue::from_bytes(line[idx + 1..].trim_ascii()).ok()?;
  Some((name, value))
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
  headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
}

fn authority_of(target: &str) -> Option<String> {
  for scheme_prefix in ["http://", "https://"] {
    if let Some(rest) = target.strip_prefix(scheme_prefix) {
      let end = rest.find('/').unwrap_or(rest.len());
      return Some(rest[..end].to_string());
    }
  }
  None
}

/// True when the authority already carries an explicit port
fn has_port(host: &str) -> bool {
  match host.rsplit_once(':') {
    Some((_, port)) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn parses_proxy_form_request() {
    let raw = b"GET http://example.test/a?b=c HTTP/1.1\r\nHost: example.test\r\nProxy-Connection: keep-alive\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let req = read_request(&mut reader, "http").await.unwrap().unwrap();
    assert_eq!(req.method, Method::GET);
    assert_eq!(req.target, "http://example.test/a?b=c");
    assert_eq!(req.host(), "example.test");
    assert_eq!(req.host_with_port(80), "example.test:80");
    assert_eq!(req.url(), "http://example.test/a?b=c");
  }

  #[tokio::test]
  async fn parses_connect_request_without_body() {
    let raw = b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let req = read_request(&mut reader, "http").await.unwrap().unwrap();
    assert_eq!(req.method, Method::CONNECT);
    assert_eq!(req.host(), "example.test:443");
    assert!(req.body.is_empty());
  }

  #[tokio::test]
  async fn reads_request_body_by_content_length() {
    let raw = b"POST /submit HTTP/1.1\r\nHost: example.test\r\nContent-Length: 5\r\n\r\nhello";
    let mut reader = BufReader::new(&raw[..]);
    let req = read_request(&mut reader, "http").await.unwrap().unwrap();
    assert_eq!(&req.body[..], b"hello");
  }

  #[tokio::test]
  async fn decodes_chunked_request_body() {
    let raw =
      b"POST /submit HTTP/1.1\r\nHost: example.test\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let req = read_request(&mut reader, "http").await.unwrap().unwrap();
    assert_eq!(&req.body[..], b"hello");
    let wire = req.to_wire();
    let text = String::from_utf8_lossy(&wire);
    assert!(text.contains("Content-Length: 5"));
    assert!(!text.to_ascii_lowercase().contains("transfer-encoding"));
  }

  #[tokio::test]
  async fn clean_eof_yields_none() {
    let raw = b"";
    let mut reader = BufReader::new(&raw[..]);
    assert!(read_request(&mut reader, "http").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn wire_form_uses_origin_form_target() {
    let raw = b"GET http://example.test/path HTTP/1.1\r\nHost: example.test\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let mut req = read_request(&mut reader, "http").await.unwrap().unwrap();
    req.sanitize();
    let wire = req.to_wire();
    let text = String::from_utf8_lossy(&wire);
    assert!(text.starts_with("GET /path HTTP/1.1\r\nHost: example.test\r\n"));
    assert!(text.contains("Connection: Keep-Alive\r\n"));
    assert!(!text.to_ascii_lowercase().contains("proxy-connection"));
  }

  #[tokio::test]
  async fn response_bytes_are_preserved_verbatim() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nX-Test: 1\r\n\r\nabc";
    let mut reader = BufReader::new(&raw[..]);
    let resp = read_response(&mut reader, false).await.unwrap();
    let mut round_trip = resp.head.clone();
    round_trip.extend_from_slice(&resp.body);
    assert_eq!(&round_trip[..], &raw[..]);
    assert_eq!(resp.status, StatusCode::OK);
    assert!(!resp.must_close());
  }

  #[tokio::test]
  async fn chunked_response_framing_is_preserved() {
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let resp = read_response(&mut reader, false).await.unwrap();
    let mut round_trip = resp.head.clone();
    round_trip.extend_from_slice(&resp.body);
    assert_eq!(&round_trip[..], &raw[..]);
  }

  #[tokio::test]
  async fn eof_delimited_response_requires_close() {
    let raw = b"HTTP/1.1 200 OK\r\n\r\nstream until eof";
    let mut reader = BufReader::new(&raw[..]);
    let resp = read_response(&mut reader, false).await.unwrap();
    assert_eq!(&resp.body[..], b"stream until eof");
    assert!(resp.must_close());
  }

  #[tokio::test]
  async fn head_response_has_no_body() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let resp = read_response(&mut reader, true).await.unwrap();
    assert!(resp.body.is_empty());
  }

  #[tokio::test]
  async fn cookie_values_join_with_semicolon() {
    let raw = b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\nCookie: a=1\r\nCookie: b=2\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let req = read_request(&mut reader, "http").await.unwrap().unwrap();
    assert_eq!(req.cookie_values(), "a=1;b=2");
  }
}
