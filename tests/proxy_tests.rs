//! End-to-end proxy scenarios over real sockets

use gomitmproxy::{
  connection_established_ack, Error, HttpRequest, MitmProxy, ProxyConfig, RelayedResponse,
  ResponseObserver, Result, INTERCEPT_ACK,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const IO_DEADLINE: Duration = Duration::from_secs(5);

/// Tests build rustls configs with the convenience builders, which panic
/// unless a process default crypto provider is installed.
fn install_crypto_provider() {
  let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn proxy_config(name: &str) -> ProxyConfig {
  let dir = std::env::temp_dir().join(format!("gomitmproxy-e2e-{}", name));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  std::fs::create_dir_all(&dir).ok();
  ProxyConfig {
    private_key_file: dir.join("key.pem"),
    cert_file: dir.join("cert.pem"),
    upstream_certs_verification: false,
    ..Default::default()
  }
}

async fn spawn_proxy(proxy: MitmProxy) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let _ = proxy.serve(listener).await;
  });
  addr
}

/// Read from `stream` until the end of an HTTP head, returning everything
/// read so far (head plus any body bytes that arrived with it).
async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
  let mut buf = [0u8; 4096];
  let mut head = Vec::new();
  loop {
    let n = stream.read(&mut buf).await.unwrap_or(0);
    if n == 0 {
      return head;
    }
    head.extend_from_slice(&buf[..n]);
    if head.windows(4).any(|w| w == b"\r\n\r\n") {
      return head;
    }
  }
}

/// Plain HTTP origin serving a canned response to every connection
async fn spawn_origin(response: &'static [u8]) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = listener.accept().await else {
        break;
      };
      tokio::spawn(async move {
        if read_head(&mut stream).await.is_empty() {
          return;
        }
        let _ = stream.write_all(response).await;
        let _ = stream.flush().await;
      });
    }
  });
  addr
}

/// TLS origin with a self-signed certificate for 127.0.0.1
async fn spawn_tls_origin(response: &'static [u8]) -> SocketAddr {
  install_crypto_provider();
  let key = rcgen::KeyPair::generate().unwrap();
  let mut params = rcgen::CertificateParams::default();
  let mut dn = rcgen::DistinguishedName::new();
  dn.push(rcgen::DnType::CommonName, "test origin");
  params.distinguished_name = dn;
  params.subject_alt_names = vec![rcgen::SanType::IpAddress("127.0.0.1".parse().unwrap())];
  let cert = params.self_signed(&key).unwrap();
  let chain = vec![CertificateDer::from(cert.der().to_vec())];
  let key_der = PrivateKeyDer::try_from(key.serialize_der()).unwrap();
  let server_config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain, key_der)
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(server_config));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        break;
      };
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(mut tls_stream) = acceptor.accept(stream).await else {
          return;
        };
        let mut buf = [0u8; 4096];
        let mut head = Vec::new();
        loop {
          let n = tls_stream.read(&mut buf).await.unwrap_or(0);
          if n == 0 {
            return;
          }
          head.extend_from_slice(&buf[..n]);
          if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
          }
        }
        let _ = tls_stream.write_all(response).await;
        let _ = tls_stream.flush().await;
      });
    }
  });
  addr
}

#[tokio::test]
async fn plain_get_relays_response_verbatim() {
  const ORIGIN_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Origin: yes\r\n\r\nhello";
  let origin = spawn_origin(ORIGIN_RESPONSE).await;

  let proxy = MitmProxy::new(proxy_config("plain-get")).await.unwrap();
  let proxy_addr = spawn_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let request = format!("GET http://{origin}/a HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();

  let mut received = vec![0u8; ORIGIN_RESPONSE.len()];
  timeout(IO_DEADLINE, client.read_exact(&mut received))
    .await
    .expect("response within deadline")
    .expect("read relayed response");
  assert_eq!(
    received, ORIGIN_RESPONSE,
    "relayed bytes must equal the origin's wire form"
  );
}

#[tokio::test]
async fn connect_intercept_acks_then_terminates_tls() {
  const ORIGIN_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\nintercepted!";
  let origin = spawn_tls_origin(ORIGIN_RESPONSE).await;

  let proxy = MitmProxy::new(proxy_config("connect-intercept")).await.unwrap();
  let ca_der = proxy.ca_cert_der().clone();
  let proxy_addr = spawn_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let connect = format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(connect.as_bytes()).await.unwrap();

  // The raw ACK bytes must arrive before any TLS record.
  let mut ack = vec![0u8; INTERCEPT_ACK.len()];
  timeout(IO_DEADLINE, client.read_exact(&mut ack))
    .await
    .expect("ack within deadline")
    .expect("read intercept ack");
  assert_eq!(ack, INTERCEPT_ACK, "intercept ACK must be byte-exact");

  // Handshake against the minted leaf, trusting only the proxy CA.
  install_crypto_provider();
  let mut roots = RootCertStore::empty();
  roots.add(ca_der).unwrap();
  let tls_config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(tls_config));
  let server_name = ServerName::try_from("127.0.0.1".to_string()).unwrap();
  let mut tls = timeout(IO_DEADLINE, connector.connect(server_name, client))
    .await
    .expect("handshake within deadline")
    .expect("client handshake against minted leaf");

  let inner = format!("GET /x HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  tls.write_all(inner.as_bytes()).await.unwrap();

  let mut received = vec![0u8; ORIGIN_RESPONSE.len()];
  timeout(IO_DEADLINE, tls.read_exact(&mut received))
    .await
    .expect("inner response within deadline")
    .expect("read inner response");
  assert_eq!(received, ORIGIN_RESPONSE);
}

#[tokio::test]
async fn upstream_proxy_refusal_closes_without_synthesized_status() {
  // Upstream proxy that refuses the tunnel with 407
  let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_addr = upstream.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = upstream.accept().await else {
        break;
      };
      tokio::spawn(async move {
        if read_head(&mut stream).await.is_empty() {
          return;
        }
        let _ = stream
          .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
          .await;
        let _ = stream.flush().await;
      });
    }
  });

  let mut config = proxy_config("upstream-407");
  config.remote_proxy_addr = Some(upstream_addr.to_string());
  let proxy = MitmProxy::new(config).await.unwrap();
  let proxy_addr = spawn_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n")
    .await
    .unwrap();

  // The refusal is logged and the socket closed; nothing is synthesized.
  let mut buf = [0u8; 64];
  let n = timeout(IO_DEADLINE, client.read(&mut buf))
    .await
    .expect("close within deadline")
    .unwrap_or(0);
  assert_eq!(n, 0, "client must see a bare close, not a proxy-made status");
}

#[tokio::test]
async fn upstream_proxy_forward_tunnels_and_terminates_on_close() {
  // Upstream proxy that accepts the tunnel, answers one ping, then closes
  let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_addr = upstream.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = upstream.accept().await else {
        break;
      };
      tokio::spawn(async move {
        if read_head(&mut stream).await.is_empty() {
          return;
        }
        let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await;
        let mut ping = [0u8; 4];
        if stream.read_exact(&mut ping).await.is_ok() {
          assert_eq!(&ping, b"ping");
          let _ = stream.write_all(b"pong").await;
          let _ = stream.flush().await;
        }
      });
    }
  });

  let mut config = proxy_config("upstream-forward");
  config.remote_proxy_addr = Some(upstream_addr.to_string());
  let proxy = MitmProxy::new(config).await.unwrap();
  let proxy_addr = spawn_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
    .await
    .unwrap();

  let expected_ack = connection_established_ack();
  let mut ack = vec![0u8; expected_ack.len()];
  timeout(IO_DEADLINE, client.read_exact(&mut ack))
    .await
    .expect("ack within deadline")
    .expect("read forward ack");
  assert_eq!(
    String::from_utf8_lossy(&ack),
    expected_ack,
    "forward ACK must carry the Proxy-Agent header byte-exactly"
  );

  client.write_all(b"ping").await.unwrap();
  let mut pong = [0u8; 4];
  timeout(IO_DEADLINE, client.read_exact(&mut pong))
    .await
    .expect("pong within deadline")
    .expect("read tunneled bytes");
  assert_eq!(&pong, b"pong");

  // Upstream closes after the pong; the tunnel must tear down promptly.
  let mut buf = [0u8; 16];
  let n = timeout(IO_DEADLINE, client.read(&mut buf))
    .await
    .expect("tunnel must terminate after upstream close")
    .unwrap_or(0);
  assert_eq!(n, 0);
}

#[tokio::test]
async fn observer_trigger_posts_cookies_to_collector() {
  const ORIGIN_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
  let origin = spawn_origin(ORIGIN_RESPONSE).await;

  // Collector capturing the observer's POST body
  let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(1);
  let collector = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let collector_addr = collector.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = collector.accept().await else {
        break;
      };
      let tx = tx.clone();
      tokio::spawn(async move {
        let mut received = read_head(&mut stream).await;
        let head_text = String::from_utf8_lossy(&received).to_string();
        let content_length: usize = head_text
          .lines()
          .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name
              .trim()
              .eq_ignore_ascii_case("content-length")
              .then(|| value.trim().parse().ok())?
          })
          .unwrap_or(0);
        let head_end = received
          .windows(4)
          .position(|w| w == b"\r\n\r\n")
          .map(|p| p + 4)
          .unwrap_or(received.len());
        while received.len() - head_end < content_length {
          let mut buf = [0u8; 4096];
          let n = stream.read(&mut buf).await.unwrap_or(0);
          if n == 0 {
            break;
          }
          received.extend_from_slice(&buf[..n]);
        }
        let _ = tx.send(received[head_end..].to_vec()).await;

        let body = br#"{"state":1000,"msg":"ok"}"#;
        let reply = format!(
          "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
          body.len()
        );
        let _ = stream.write_all(reply.as_bytes()).await;
        let _ = stream.write_all(body).await;
        let _ = stream.flush().await;
      });
    }
  });

  let mut config = proxy_config("observer-trigger");
  config.collector_url = Some(format!("http://{collector_addr}/ingest"));
  let proxy = MitmProxy::new(config).await.unwrap();
  let proxy_addr = spawn_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let request = format!(
    "GET http://pub.alimama.com/code HTTP/1.1\r\nHost: {origin}\r\nCookie: a=1\r\nCookie: b=2\r\n\r\n"
  );
  client.write_all(request.as_bytes()).await.unwrap();

  let mut received = vec![0u8; ORIGIN_RESPONSE.len()];
  timeout(IO_DEADLINE, client.read_exact(&mut received))
    .await
    .expect("response within deadline")
    .expect("read relayed response");
  assert_eq!(received, ORIGIN_RESPONSE);

  let posted = timeout(IO_DEADLINE, rx.recv())
    .await
    .expect("collector POST within deadline")
    .expect("collector received a body");
  let payload: serde_json::Value = serde_json::from_slice(&posted).expect("JSON payload");
  assert_eq!(
    payload["cookies"], "a=1;b=2",
    "cookie values must be joined by a semicolon"
  );
}

struct FailingObserver;

#[async_trait::async_trait]
impl ResponseObserver for FailingObserver {
  async fn observe(&self, _request: &HttpRequest, _response: &RelayedResponse) -> Result<()> {
    Err(Error::Observer("always fails".to_string()))
  }
}

#[tokio::test]
async fn failing_observer_does_not_alter_the_response() {
  const ORIGIN_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nstable";
  let origin = spawn_origin(ORIGIN_RESPONSE).await;

  let proxy = MitmProxy::new(proxy_config("observer-isolation"))
    .await
    .unwrap()
    .with_observer(Box::new(FailingObserver));
  let proxy_addr = spawn_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let request = format!("GET http://{origin}/a HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();

  let mut received = vec![0u8; ORIGIN_RESPONSE.len()];
  timeout(IO_DEADLINE, client.read_exact(&mut received))
    .await
    .expect("response within deadline")
    .expect("read relayed response");
  assert_eq!(
    received, ORIGIN_RESPONSE,
    "an erroring observer must never change client-visible bytes"
  );
}

#[tokio::test]
async fn failed_origin_tls_dial_closes_without_status() {
  // Origin that accepts TCP and immediately closes, so the proxy's TLS
  // dial toward it fails after the client-side session is already up.
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = origin.accept().await else {
        break;
      };
      drop(stream);
    }
  });

  let proxy = MitmProxy::new(proxy_config("origin-tls-failure")).await.unwrap();
  let ca_der = proxy.ca_cert_der().clone();
  let proxy_addr = spawn_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let connect = format!("CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
  client.write_all(connect.as_bytes()).await.unwrap();
  let mut ack = vec![0u8; INTERCEPT_ACK.len()];
  client.read_exact(&mut ack).await.unwrap();

  install_crypto_provider();
  let mut roots = RootCertStore::empty();
  roots.add(ca_der).unwrap();
  let tls_config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(tls_config));
  let server_name = ServerName::try_from("127.0.0.1".to_string()).unwrap();
  let mut tls = connector.connect(server_name, client).await.unwrap();

  let inner = format!("GET /x HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
  tls.write_all(inner.as_bytes()).await.unwrap();

  // TLS toward the client is already established, so there is no channel
  // for a 5xx: the session just ends.
  let mut buf = [0u8; 64];
  match timeout(IO_DEADLINE, tls.read(&mut buf)).await {
    Ok(Ok(0)) | Ok(Err(_)) => {}
    Ok(Ok(n)) => panic!(
      "expected a bare close, got bytes: {:?}",
      String::from_utf8_lossy(&buf[..n])
    ),
    Err(_) => panic!("connection did not terminate within the deadline"),
  }
}
