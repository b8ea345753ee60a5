//! Front listener: accepts client connections and serves the proxy pipeline.

use crate::proxy::Forwarder;
use crate::tls::TlsManager;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// The front HTTP(S) server.
pub struct Server {
    listener: TcpListener,
    forwarder: Arc<Forwarder>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Bind the listener. With a TLS manager, connections are terminated
    /// with its hot-reloading certificate configuration.
    pub async fn bind(
        addr: SocketAddr,
        forwarder: Arc<Forwarder>,
        tls: Option<&TlsManager>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            listen = %listener.local_addr()?,
            tls = tls.is_some(),
            "listener bound"
        );

        Ok(Self {
            listener,
            forwarder,
            tls: tls.map(|manager| TlsAcceptor::from(manager.server_config())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown, then drain in-flight connections
    /// within a bounded grace window.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let forwarder = Arc::clone(&self.forwarder);
                            let tls = self.tls.clone();
                            connections.spawn(async move {
                                handle_connection(stream, peer, forwarder, tls).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                // Reap finished connection tasks so the set stays small.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                _ = shutdown.recv() => {
                    info!("listener shutting down");
                    break;
                }
            }
        }

        // New connections are already rejected (the listener is dropped once
        // run returns); give the in-flight ones a bounded grace window.
        drop(self.listener);
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            warn!(grace = ?DRAIN_GRACE, "drain grace elapsed, aborting remaining connections");
            connections.shutdown().await;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    forwarder: Arc<Forwarder>,
    tls: Option<TlsAcceptor>,
) {
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => serve(TokioIo::new(tls_stream), peer, forwarder, true).await,
            Err(e) => {
                warn!(client = %peer, error = %e, "TLS handshake failed");
            }
        },
        None => serve(TokioIo::new(stream), peer, forwarder, false).await,
    }
}

async fn serve<I>(io: I, peer: SocketAddr, forwarder: Arc<Forwarder>, tls: bool)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let forwarder = Arc::clone(&forwarder);
        async move {
            Ok::<_, std::convert::Infallible>(forwarder.handle(req, peer, tls).await)
        }
    });

    if let Err(e) = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await
    {
        debug!(client = %peer, error = %e, "connection ended with error");
    }
}
