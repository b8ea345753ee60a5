//! Dummy HTTP backend for exercising the load balancer by hand.
//!
//! Answers `/health` with 200 OK and anything else with a line naming the
//! port it runs on, which makes routing decisions visible from curl.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// A dummy backend server.
#[derive(Parser, Debug)]
#[command(name = "testserver")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8081)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to bind port {}", cli.port))?;
    info!(port = cli.port, "test server listening");

    let port = cli.port;
    let accept_loop = async {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| async move {
                            debug!(port, path = %req.uri().path(), "request");
                            let response = match req.uri().path() {
                                "/health" => Response::new(Full::new(Bytes::from_static(b"OK"))),
                                _ => Response::new(Full::new(Bytes::from(format!(
                                    "Server running on port {}",
                                    port
                                )))),
                            };
                            Ok::<_, Infallible>(response)
                        });

                        if let Err(e) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(error = %e, "connection error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("test server shutting down");
        }
    }

    Ok(())
}
