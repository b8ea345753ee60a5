//! Upstream HTTP client for a single attempt.
//!
//! Dials the backend, performs an HTTP/1.1 handshake, and sends one request
//! in origin form. Both the forwarder and the health probe go through here.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{HeaderMap, Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::warn;

/// Upstream call failure. All variants except `BadTarget` are transport
/// class and safe to retry.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to backend: {0}")]
    Connect(#[source] std::io::Error),

    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("upstream attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid upstream target: {0}")]
    BadTarget(String),
}

/// A request ready to be replayed against a backend: the inbound request
/// with its body buffered, or a synthetic probe request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Origin-form target: path plus raw query.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// A bodyless GET, as used by health probes.
    pub fn get(path: &str) -> Self {
        Self {
            method: Method::GET,
            path_and_query: path.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Send `request` to the backend at `upstream` under `deadline`.
///
/// The deadline covers connect, handshake, and response headers; the
/// response body streams beyond it under the connection's own lifetime.
pub async fn send_request(
    upstream: &Uri,
    request: &OutboundRequest,
    deadline: Duration,
) -> Result<Response<Incoming>, UpstreamError> {
    let authority = upstream
        .authority()
        .ok_or_else(|| UpstreamError::BadTarget(format!("no host in {}", upstream)))?
        .clone();
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(80);

    // A base path on the upstream URL is prepended to the request target.
    let base = upstream.path().trim_end_matches('/');
    let target = if base.is_empty() {
        request.path_and_query.clone()
    } else {
        format!("{}{}", base, request.path_and_query)
    };

    match tokio::time::timeout(deadline, dial_and_send(host, port, &authority, &target, request)).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::Timeout(deadline)),
    }
}

async fn dial_and_send(
    host: String,
    port: u16,
    authority: &hyper::http::uri::Authority,
    target: &str,
    request: &OutboundRequest,
) -> Result<Response<Incoming>, UpstreamError> {
    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(UpstreamError::Connect)?;
    let _ = stream.set_nodelay(true);

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the connection until the exchange completes.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!(error = %e, "backend connection error");
        }
    });

    let uri: Uri = target
        .parse()
        .map_err(|_| UpstreamError::BadTarget(target.to_string()))?;

    let mut upstream_req = Request::builder()
        .method(request.method.clone())
        .uri(uri)
        .body(Full::new(request.body.clone()))
        .map_err(|e| UpstreamError::BadTarget(e.to_string()))?;
    *upstream_req.headers_mut() = request.headers.clone();

    // HTTP/1.1 requires Host; the inbound header is preserved when present.
    if !upstream_req.headers().contains_key(HOST) {
        if let Ok(value) = authority.as_str().parse() {
            upstream_req.headers_mut().insert(HOST, value);
        }
    }

    Ok(sender.send_request(upstream_req).await?)
}
