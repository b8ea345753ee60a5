//! The per-request proxy pipeline.
//!
//! Session lookup, backend selection, breaker gating, the retry loop around
//! the upstream call, metrics accounting, and session pinning all live here.

use crate::backend::{Backend, BreakerState};
use crate::balancer::Selector;
use crate::metrics::Metrics;
use crate::proxy::client::{send_request, OutboundRequest, UpstreamError};
use crate::retry::{self, Attempt, RetryError};
use crate::session::{ClientIdentity, SessionManager};
use crate::util::RequestId;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Request, Response, StatusCode};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Deadline for a single upstream attempt.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// One upstream attempt failure, classified for the retry executor.
#[derive(Debug, Error)]
enum AttemptFailure {
    #[error(transparent)]
    Transport(#[from] UpstreamError),

    #[error("upstream returned status {0}")]
    ServerError(StatusCode),
}

/// The request pipeline shared by every connection.
pub struct Forwarder {
    selector: Arc<dyn Selector>,
    session: Arc<SessionManager>,
    metrics: Metrics,
}

impl Forwarder {
    pub fn new(selector: Arc<dyn Selector>, session: Arc<SessionManager>, metrics: Metrics) -> Self {
        Self {
            selector,
            session,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Handle one inbound request end to end.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
        tls: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Display,
    {
        if req.uri().path() == "/metrics" {
            return metrics_response(&self.metrics);
        }

        self.metrics.inc_total_requests();

        let request_id = RequestId::new();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let identity = ClientIdentity::from_request(&req, client_addr, tls);

        // Buffer the body up front; a retried attempt has to replay it.
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "failed to read request body");
                self.metrics.inc_failed_requests();
                return error_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let outbound = OutboundRequest {
            method: parts.method,
            path_and_query,
            // Copied verbatim; this preserves the inbound Host upstream.
            headers: parts.headers,
            body,
        };

        // A pinned backend is used only while it is still selectable;
        // otherwise fall through to a fresh pick.
        let mut pinned = None;
        if let Some(id) = self.session.lookup(&identity) {
            if let Ok(candidate) = self.selector.get(&id) {
                if candidate.admit() {
                    pinned = Some(candidate);
                }
            }
        }

        let backend = match pinned {
            Some(backend) => backend,
            None => match self.selector.next() {
                Ok(backend) => backend,
                Err(e) => {
                    debug!(request_id = %request_id, error = %e, "no backend available");
                    self.metrics.inc_failed_requests();
                    return error_response(StatusCode::SERVICE_UNAVAILABLE, "No available backends");
                }
            },
        };

        debug!(
            request_id = %request_id,
            method = %method,
            path = %path,
            backend = %backend.id(),
            "forwarding request"
        );

        self.metrics.inc_backend_requests(backend.id());
        let _guard = InflightGuard::new(&self.metrics, &backend);

        // A half-open breaker admitted this request as a probe; the retry
        // loop is capped at one attempt.
        let policy = if backend.breaker().state() == BreakerState::HalfOpen {
            backend.retry().single_attempt()
        } else {
            backend.retry().clone()
        };

        let started = Instant::now();
        let upstream = backend.upstream();
        let result = retry::execute(&policy, |_attempt| {
            let outbound = &outbound;
            async move {
                match send_request(upstream, outbound, UPSTREAM_TIMEOUT).await {
                    Ok(resp) if resp.status().is_server_error() => {
                        Attempt::Retry(AttemptFailure::ServerError(resp.status()))
                    }
                    Ok(resp) => Attempt::Ok(resp),
                    Err(e @ UpstreamError::BadTarget(_)) => {
                        Attempt::Terminal(AttemptFailure::Transport(e))
                    }
                    Err(e) => Attempt::Retry(AttemptFailure::Transport(e)),
                }
            }
        })
        .await;
        let elapsed = started.elapsed();
        self.metrics.record_backend_latency(backend.id(), elapsed);

        match result {
            Ok(upstream_response) => {
                backend.breaker().record_success();
                info!(
                    request_id = %request_id,
                    backend = %backend.id(),
                    status = upstream_response.status().as_u16(),
                    duration_ms = elapsed.as_millis(),
                    "request proxied"
                );

                let (parts, body) = upstream_response.into_parts();
                let mut response = Response::from_parts(parts, body.boxed());
                self.session.remember(&identity, &mut response, backend.id());
                response
            }
            Err(failure) => {
                backend.breaker().record_failure();
                self.metrics.inc_backend_failures(backend.id());
                self.metrics.inc_failed_requests();
                warn!(
                    request_id = %request_id,
                    backend = %backend.id(),
                    error = %failure_message(&failure),
                    "request failed"
                );

                match failure {
                    RetryError::Exhausted(_) => {
                        error_response(StatusCode::BAD_GATEWAY, "Backend error")
                    }
                    RetryError::Terminal(_) => {
                        error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                    }
                }
            }
        }
    }
}

fn failure_message(failure: &RetryError<AttemptFailure>) -> String {
    match failure {
        RetryError::Exhausted(e) => format!("retries exhausted: {}", e),
        RetryError::Terminal(e) => e.to_string(),
    }
}

/// Releases the in-flight counter and active-connection gauge on every exit
/// path, unwinds included.
struct InflightGuard {
    metrics: Metrics,
    backend: Arc<Backend>,
}

impl InflightGuard {
    fn new(metrics: &Metrics, backend: &Arc<Backend>) -> Self {
        metrics.inc_active_connections(backend.id());
        backend.inc_inflight();
        Self {
            metrics: metrics.clone(),
            backend: Arc::clone(backend),
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.backend.dec_inflight();
        self.metrics.dec_active_connections(self.backend.id());
    }
}

fn metrics_response(metrics: &Metrics) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = Full::new(Bytes::from(metrics.render()))
        .map_err(|never| match never {})
        .boxed();

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
        .body(body)
        .unwrap()
}

/// Create an error response.
fn error_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = Full::new(Bytes::from(format!("{}\n", message)))
        .map_err(|never| match never {})
        .boxed();

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(body)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BreakerConfig;
    use crate::balancer::{self, RoundRobin};
    use crate::config::{Algorithm, SessionType, StickySessionConfig};
    use crate::retry::RetryPolicy;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    /// An upstream whose response status is scripted per request; after the
    /// script runs out it answers 200 with its own name as the body.
    async fn spawn_upstream(name: &'static str, script: Vec<u16>) -> (SocketAddr, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let script = Arc::new(script);

        let hits_srv = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let hits = Arc::clone(&hits_srv);
                let script = Arc::clone(&script);
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let n = hits.fetch_add(1, Ordering::SeqCst) as usize;
                        let status = script.get(n).copied().unwrap_or(200);
                        async move {
                            let mut resp = Response::new(Full::new(Bytes::from(name)));
                            *resp.status_mut() = StatusCode::from_u16(status).unwrap();
                            Ok::<_, Infallible>(resp)
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (addr, hits)
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            multiplier: 2.0,
            randomization: 0.1,
        }
    }

    fn backend_for(id: &str, addr: SocketAddr, breaker: BreakerConfig, retry: RetryPolicy) -> Arc<Backend> {
        Arc::new(Backend::new(
            id,
            format!("http://{}", addr).parse().unwrap(),
            1,
            breaker,
            retry,
        ))
    }

    fn disabled_sessions() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(StickySessionConfig::default()))
    }

    fn ip_sessions() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(StickySessionConfig {
            enabled: true,
            session_type: SessionType::Ip,
            ttl: Duration::from_secs(3600),
            ..StickySessionConfig::default()
        }))
    }

    fn get_request(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_text(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).to_string()
    }

    fn client() -> SocketAddr {
        "10.0.0.7:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_round_robin_across_backends() {
        let (addr_a, _) = spawn_upstream("a", vec![]).await;
        let (addr_b, _) = spawn_upstream("b", vec![]).await;
        let (addr_c, _) = spawn_upstream("c", vec![]).await;

        let selector = balancer::new_selector(&Algorithm::RoundRobin);
        for (id, addr) in [("a", addr_a), ("b", addr_b), ("c", addr_c)] {
            selector.add(id, backend_for(id, addr, BreakerConfig::default(), fast_retry(0)));
        }
        let fwd = Forwarder::new(selector, disabled_sessions(), Metrics::new());

        let mut seen = Vec::new();
        for _ in 0..9 {
            let resp = fwd.handle(get_request("/"), client(), false).await;
            assert_eq!(resp.status(), StatusCode::OK);
            seen.push(body_text(resp).await);
        }
        assert_eq!(seen, ["a", "b", "c", "a", "b", "c", "a", "b", "c"]);

        assert_eq!(fwd.metrics().total_requests(), 9);
        assert_eq!(fwd.metrics().failed_requests(), 0);
        for id in ["a", "b", "c"] {
            assert_eq!(fwd.metrics().backend_requests(id), 3);
            assert_eq!(fwd.metrics().active_connections(id), 0);
        }
    }

    #[tokio::test]
    async fn test_no_backends_is_503() {
        let selector: Arc<dyn Selector> = Arc::new(RoundRobin::new());
        let fwd = Forwarder::new(selector, disabled_sessions(), Metrics::new());

        let resp = fwd.handle(get_request("/"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(fwd.metrics().failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        // 500, 500, then 200: the client sees a 200 and no backend failure
        // is recorded.
        let (addr, hits) = spawn_upstream("a", vec![500, 500, 200]).await;
        let selector = balancer::new_selector(&Algorithm::RoundRobin);
        selector.add("a", backend_for("a", addr, BreakerConfig::default(), fast_retry(2)));
        let fwd = Forwarder::new(selector, disabled_sessions(), Metrics::new());

        let resp = fwd.handle(get_request("/"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(fwd.metrics().total_requests(), 1);
        assert_eq!(fwd.metrics().backend_failures("a"), 0);
        assert_eq!(fwd.metrics().backend_requests("a"), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_is_502() {
        let (addr, hits) = spawn_upstream("a", vec![500, 500, 500, 500]).await;
        let selector = balancer::new_selector(&Algorithm::RoundRobin);
        selector.add("a", backend_for("a", addr, BreakerConfig::default(), fast_retry(1)));
        let fwd = Forwarder::new(selector, disabled_sessions(), Metrics::new());

        let resp = fwd.handle(get_request("/"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(fwd.metrics().backend_failures("a"), 1);
        assert_eq!(fwd.metrics().failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_4xx_is_proxied_as_terminal_success() {
        let (addr, hits) = spawn_upstream("a", vec![404]).await;
        let selector = balancer::new_selector(&Algorithm::RoundRobin);
        selector.add("a", backend_for("a", addr, BreakerConfig::default(), fast_retry(3)));
        let fwd = Forwarder::new(selector, disabled_sessions(), Metrics::new());

        let resp = fwd.handle(get_request("/missing"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        // No retry was attempted and nothing counts as a backend failure.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fwd.metrics().backend_failures("a"), 0);
        assert_eq!(fwd.metrics().failed_requests(), 0);
    }

    #[tokio::test]
    async fn test_breaker_trips_and_rejects_without_upstream_contact() {
        let (addr, hits) = spawn_upstream("a", vec![500, 500, 500]).await;
        let breaker = BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_limit: 1,
        };
        let selector = balancer::new_selector(&Algorithm::RoundRobin);
        selector.add("a", backend_for("a", addr, breaker, fast_retry(0)));
        let fwd = Forwarder::new(selector, disabled_sessions(), Metrics::new());

        for _ in 0..3 {
            let resp = fwd.handle(get_request("/"), client(), false).await;
            assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // Fourth request: the breaker is open, upstream is never contacted.
        let resp = fwd.handle(get_request("/"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_half_open_probe_after_reset() {
        let (addr, hits) = spawn_upstream("a", vec![500, 200]).await;
        let breaker = BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(50),
            half_open_limit: 1,
        };
        let selector = balancer::new_selector(&Algorithm::RoundRobin);
        selector.add("a", backend_for("a", addr, breaker, fast_retry(0)));
        let fwd = Forwarder::new(selector, disabled_sessions(), Metrics::new());

        let resp = fwd.handle(get_request("/"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let resp = fwd.handle(get_request("/"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        tokio::time::sleep(Duration::from_millis(70)).await;

        // One probe is admitted and succeeds, closing the breaker.
        let resp = fwd.handle(get_request("/"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let resp = fwd.handle(get_request("/"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_session_affinity_and_failover() {
        let (addr_a, _) = spawn_upstream("a", vec![]).await;
        let (addr_b, _) = spawn_upstream("b", vec![]).await;

        let selector = balancer::new_selector(&Algorithm::RoundRobin);
        selector.add("a", backend_for("a", addr_a, BreakerConfig::default(), fast_retry(0)));
        selector.add("b", backend_for("b", addr_b, BreakerConfig::default(), fast_retry(0)));
        let fwd = Forwarder::new(Arc::clone(&selector), ip_sessions(), Metrics::new());

        // First request pins whatever selection returned.
        let first = body_text(fwd.handle(get_request("/"), client(), false).await).await;
        assert_eq!(first, "a");

        for _ in 0..5 {
            let body = body_text(fwd.handle(get_request("/"), client(), false).await).await;
            assert_eq!(body, "a");
        }

        // A different client is not pinned to "a".
        let other: SocketAddr = "10.0.0.8:50000".parse().unwrap();
        let body = body_text(fwd.handle(get_request("/"), other, false).await).await;
        assert_eq!(body, "b");

        // Failover: once "a" goes unhealthy the pinned client moves to "b"
        // and the session entry is updated.
        selector.get("a").unwrap().set_healthy(false);
        let body = body_text(fwd.handle(get_request("/"), client(), false).await).await;
        assert_eq!(body, "b");

        selector.get("a").unwrap().set_healthy(true);
        let body = body_text(fwd.handle(get_request("/"), client(), false).await).await;
        assert_eq!(body, "b");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let selector: Arc<dyn Selector> = Arc::new(RoundRobin::new());
        let fwd = Forwarder::new(selector, disabled_sessions(), Metrics::new());

        let resp = fwd.handle(get_request("/metrics"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
        let body = body_text(resp).await;
        assert!(body.contains("load_balancer_total_requests 0"));

        // Serving /metrics does not count as a proxied request.
        assert_eq!(fwd.metrics().total_requests(), 0);
    }

    #[tokio::test]
    async fn test_inflight_balanced_after_failure() {
        let selector = balancer::new_selector(&Algorithm::RoundRobin);
        // Nothing listens on port 1: every attempt is a transport error.
        let backend = Arc::new(Backend::new(
            "a",
            "http://127.0.0.1:1".parse().unwrap(),
            1,
            BreakerConfig::default(),
            fast_retry(1),
        ));
        selector.add("a", Arc::clone(&backend));
        let fwd = Forwarder::new(selector, disabled_sessions(), Metrics::new());

        let resp = fwd.handle(get_request("/"), client(), false).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(backend.inflight(), 0);
        assert_eq!(fwd.metrics().active_connections("a"), 0);
    }
}
