//! Health probes.

use crate::proxy::{send_request, OutboundRequest};
use hyper::Uri;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// A single health check against one backend.
pub trait Probe: Send + Sync + 'static {
    /// Run one check. `Ok` means the backend is healthy; `Err` carries the
    /// failure reason.
    fn check(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
}

/// HTTP probe: `GET <upstream><path>` under a timeout, healthy iff the
/// response status matches the expected one. The response body is not read.
pub struct HttpProbe {
    upstream: Uri,
    path: String,
    timeout: Duration,
    expected_status: u16,
}

impl HttpProbe {
    pub fn new(upstream: Uri, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            upstream,
            path: path.into(),
            timeout,
            expected_status: 200,
        }
    }

    pub fn expected_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }
}

impl Probe for HttpProbe {
    fn check(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            let request = OutboundRequest::get(&self.path);
            let response = send_request(&self.upstream, &request, self.timeout)
                .await
                .map_err(|e| e.to_string())?;

            let status = response.status().as_u16();
            if status == self.expected_status {
                Ok(())
            } else {
                Err(format!(
                    "unexpected status: {} (expected {})",
                    status, self.expected_status
                ))
            }
        })
    }
}
