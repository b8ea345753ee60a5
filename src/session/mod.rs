//! Sticky session management.
//!
//! Maps a client identity (address or cookie) to the backend that served it,
//! so follow-up requests land on the same backend while it stays selectable.
//! Entries expire after a TTL; a background sweeper removes expired entries
//! and a capacity bound evicts the entry closest to expiry.

use crate::config::{SessionType, StickySessionConfig};
use hyper::header::{HeaderValue, SET_COOKIE};
use hyper::{Request, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// The parts of an inbound request the session manager keys on, captured
/// before the request is consumed by the proxy pipeline.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    forwarded_for: Option<String>,
    peer: SocketAddr,
    cookie_header: Option<String>,
    tls: bool,
}

impl ClientIdentity {
    pub fn from_request<B>(req: &Request<B>, peer: SocketAddr, tls: bool) -> Self {
        let forwarded_for = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let cookie_header = req
            .headers()
            .get(hyper::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Self {
            forwarded_for,
            peer,
            cookie_header,
            tls,
        }
    }

    /// Test-friendly constructor.
    pub fn new(
        forwarded_for: Option<String>,
        peer: SocketAddr,
        cookie_header: Option<String>,
        tls: bool,
    ) -> Self {
        Self {
            forwarded_for,
            peer,
            cookie_header,
            tls,
        }
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    backend_id: String,
    expires_at: Instant,
}

/// Sticky session manager.
///
/// All of `lookup`, `remember` and the sweeper contend on one mutex; the
/// critical sections only touch the in-memory map.
pub struct SessionManager {
    config: StickySessionConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    shutdown: broadcast::Sender<()>,
}

impl SessionManager {
    pub fn new(config: StickySessionConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Spawn the background sweeper. Does nothing when sessions are disabled.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; nothing has expired yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = manager.sweep();
                        if removed > 0 {
                            debug!(removed, "session sweep removed expired entries");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("session sweeper shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Stop the sweeper. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// The backend id previously pinned for this client, if the entry is
    /// still live. Expired entries read as absent; the sweeper deletes them.
    pub fn lookup(&self, identity: &ClientIdentity) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let key = self.session_key(identity)?;
        let sessions = self.sessions.lock().unwrap();
        let entry = sessions.get(&key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.backend_id.clone())
    }

    /// Pin `backend_id` for this client.
    ///
    /// In cookie mode a client without a session cookie gets a fresh opaque
    /// value, and a `Set-Cookie` header is added to the outgoing response.
    pub fn remember<B>(
        &self,
        identity: &ClientIdentity,
        response: &mut Response<B>,
        backend_id: &str,
    ) {
        if !self.config.enabled || backend_id.is_empty() {
            return;
        }

        let key = match self.config.session_type {
            SessionType::Ip => match self.session_key(identity) {
                Some(key) => key,
                None => return,
            },
            SessionType::Cookie => match self.session_key(identity) {
                Some(key) => key,
                None => {
                    let key = uuid::Uuid::new_v4().simple().to_string();
                    self.set_cookie(response, &key, identity.tls);
                    key
                }
            },
        };

        let mut sessions = self.sessions.lock().unwrap();
        if sessions.len() >= self.config.max_sessions {
            Self::evict_oldest(&mut sessions);
        }
        sessions.insert(
            key,
            SessionEntry {
                backend_id: backend_id.to_string(),
                expires_at: Instant::now() + self.config.ttl,
            },
        );
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        before - sessions.len()
    }

    /// Number of live entries, expired or not.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn session_key(&self, identity: &ClientIdentity) -> Option<String> {
        match self.config.session_type {
            // The key must survive reconnects, so the peer port is dropped.
            SessionType::Ip => Some(
                identity
                    .forwarded_for
                    .clone()
                    .unwrap_or_else(|| identity.peer.ip().to_string()),
            ),
            SessionType::Cookie => {
                let header = identity.cookie_header.as_deref()?;
                cookie_value(header, &self.config.cookie_name)
            }
        }
    }

    fn set_cookie<B>(&self, response: &mut Response<B>, value: &str, tls: bool) {
        let expires = httpdate::fmt_http_date(SystemTime::now() + self.config.ttl);
        let cookie = format!(
            "{}={}; Path=/; Expires={}; HttpOnly; SameSite=Lax{}",
            self.config.cookie_name,
            value,
            expires,
            if tls { "; Secure" } else { "" }
        );
        if let Ok(header) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, header);
        }
    }

    /// Evict the single entry closest to expiry.
    fn evict_oldest(sessions: &mut HashMap<String, SessionEntry>) {
        let oldest = sessions
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            sessions.remove(&key);
        }
    }
}

/// Extract the value of `name` from a `Cookie` request header.
fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
