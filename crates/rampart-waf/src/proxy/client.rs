//! Upstream connection establishment.
//!
//! Connections are raw hyper HTTP/1.1 handshakes over TCP (plus rustls for
//! https upstreams) so the pool layer owns their full lifecycle; hyper's
//! built-in pooling is deliberately not used here.

use super::tls::client_tls_config;
use crate::error::WafError;
use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1;
use hyper::Uri;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A parsed upstream address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    /// Parse an absolute URL like `http://127.0.0.1:9000/`. Anything that
    /// is not http/https with a host fails.
    pub fn parse(url: &str) -> Option<Self> {
        let uri: Uri = url.parse().ok()?;
        let scheme = match uri.scheme_str()? {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return None,
        };
        let host = uri.host()?.to_string();
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        Some(Self { scheme, host, port })
    }

    /// `host[:port]` with default ports omitted, the Host header form.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.address())
    }
}

/// An established HTTP/1.1 connection to an upstream.
pub struct UpstreamConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    driver: tokio::task::JoinHandle<()>,
}

impl UpstreamConnection {
    /// Health check: false once the peer closed or the driver finished.
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed() && !self.driver.is_finished()
    }

    /// Send one request and await the response head + body stream.
    pub async fn send(
        &mut self,
        request: hyper::Request<Full<Bytes>>,
    ) -> Result<hyper::Response<hyper::body::Incoming>, WafError> {
        self.sender
            .ready()
            .await
            .map_err(|e| WafError::UpstreamIo(e.to_string()))?;
        self.sender
            .send_request(request)
            .await
            .map_err(|e| WafError::UpstreamIo(e.to_string()))
    }

    /// Tear the connection down. Errored connections always come through
    /// here, never back to a pool.
    pub fn close(self) {
        self.driver.abort();
    }
}

/// Open a connection to `target`, with TLS when the scheme is https.
pub async fn connect(
    target: &UpstreamTarget,
    verify_tls: bool,
    connect_timeout: Duration,
) -> Result<UpstreamConnection, WafError> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(target.address()))
        .await
        .map_err(|_| WafError::UpstreamConnect(format!("connect timeout to {target}")))?
        .map_err(|e| WafError::UpstreamConnect(format!("{target}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| WafError::UpstreamConnect(e.to_string()))?;

    match target.scheme {
        Scheme::Http => handshake(TokioIo::new(stream), target).await,
        Scheme::Https => {
            let connector = TlsConnector::from(client_tls_config(verify_tls));
            let server_name = ServerName::try_from(target.host.clone())
                .map_err(|e| WafError::UpstreamConnect(format!("bad SNI host: {e}")))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| WafError::UpstreamConnect(format!("tls handshake: {e}")))?;
            handshake(TokioIo::new(tls_stream), target).await
        }
    }
}

async fn handshake<T>(io: T, target: &UpstreamTarget) -> Result<UpstreamConnection, WafError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(io)
        .await
        .map_err(|e| WafError::UpstreamConnect(format!("http handshake: {e}")))?;

    let peer = target.to_string();
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            trace!(upstream = %peer, error = %e, "upstream connection closed with error");
        }
    });

    debug!(upstream = %target, "upstream connection established");
    Ok(UpstreamConnection { sender, driver })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_url() {
        let t = UpstreamTarget::parse("http://127.0.0.1:9000/").unwrap();
        assert_eq!(t.scheme, Scheme::Http);
        assert_eq!(t.host, "127.0.0.1");
        assert_eq!(t.port, 9000);
        assert_eq!(t.authority(), "127.0.0.1:9000");
    }

    #[test]
    fn test_parse_default_ports() {
        let t = UpstreamTarget::parse("http://app.internal/").unwrap();
        assert_eq!(t.port, 80);
        assert_eq!(t.authority(), "app.internal");

        let t = UpstreamTarget::parse("https://app.internal").unwrap();
        assert_eq!(t.port, 443);
        assert_eq!(t.authority(), "app.internal");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(UpstreamTarget::parse("").is_none());
        assert!(UpstreamTarget::parse("not a url").is_none());
        assert!(UpstreamTarget::parse("ftp://files.example/").is_none());
        assert!(UpstreamTarget::parse("/just/a/path").is_none());
    }

    #[test]
    fn test_display() {
        let t = UpstreamTarget::parse("https://app.internal:8443/x/y").unwrap();
        assert_eq!(t.to_string(), "https://app.internal:8443");
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_connect_error() {
        // Port 1 on localhost is essentially never listening.
        let target = UpstreamTarget::parse("http://127.0.0.1:1/").unwrap();
        let err = connect(&target, true, Duration::from_millis(500))
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, WafError::UpstreamConnect(_)));
    }

    #[tokio::test]
    async fn test_connect_and_send_roundtrip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Minimal single-shot HTTP/1.1 upstream.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let target = UpstreamTarget::parse(&format!("http://{addr}/")).unwrap();
        let mut conn = connect(&target, true, Duration::from_secs(2)).await.unwrap();
        assert!(conn.is_open());

        let req = hyper::Request::builder()
            .method("GET")
            .uri("/")
            .header("host", target.authority())
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = conn.send(req).await.unwrap();
        assert_eq!(resp.status(), 200);
    }
}
