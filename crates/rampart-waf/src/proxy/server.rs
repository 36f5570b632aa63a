//! The WAF server: listeners and the accept loop.
//!
//! Runs an HTTP listener, a TLS listener, or both; config validation
//! guarantees at least one is enabled. Every accepted connection is served
//! by the pipeline in [`super::handler`].

use super::handler::handle_request;
use super::network::create_reusable_listener;
use super::tls::create_tls_acceptor;
use crate::runtime::WafRuntime;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

pub struct WafServer {
    runtime: Arc<WafRuntime>,
}

impl WafServer {
    pub fn new(runtime: Arc<WafRuntime>) -> Self {
        Self { runtime }
    }

    /// Bind the enabled listeners and serve until the process shuts down.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let config = self.runtime.config();
        let mut tasks = Vec::new();

        if config.server.http_enabled {
            let addr = SocketAddr::from(([0, 0, 0, 0], config.server.http_port));
            let listener = create_reusable_listener(addr)?;
            info!("http listener on {}", addr);
            let runtime = Arc::clone(&self.runtime);
            tasks.push(tokio::spawn(async move {
                serve_plain(listener, runtime).await;
            }));
        }

        if config.server.https_enabled {
            let cert = config
                .server
                .tls_cert_file
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("https enabled without tls_cert_file"))?;
            let key = config
                .server
                .tls_key_file
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("https enabled without tls_key_file"))?;
            let acceptor = create_tls_acceptor(cert, key)?;

            let addr = SocketAddr::from(([0, 0, 0, 0], config.server.https_port));
            let listener = create_reusable_listener(addr)?;
            info!("https listener on {}", addr);
            let runtime = Arc::clone(&self.runtime);
            tasks.push(tokio::spawn(async move {
                serve_tls(listener, acceptor, runtime).await;
            }));
        }

        if tasks.is_empty() {
            anyhow::bail!("no listeners enabled");
        }
        futures::future::join_all(tasks).await;
        Ok(())
    }
}

/// Serve one listener over a given runtime; used directly by integration
/// tests with an ephemeral-port listener.
pub async fn serve_plain(listener: TcpListener, runtime: Arc<WafRuntime>) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let runtime = Arc::clone(&runtime);
                async move { Ok::<_, Infallible>(handle_request(&runtime, req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(remote = %remote_addr, error = %e, "error serving http connection");
            }
        });
    }
}

async fn serve_tls(listener: TcpListener, acceptor: TlsAcceptor, runtime: Arc<WafRuntime>) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    error!(remote = %remote_addr, error = %e, "tls handshake failed");
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let service = service_fn(move |req| {
                let runtime = Arc::clone(&runtime);
                async move { Ok::<_, Infallible>(handle_request(&runtime, req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(remote = %remote_addr, error = %e, "error serving https connection");
            }
        });
    }
}
