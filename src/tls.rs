//! TLS termination: certificate loading, server configuration, hot reload.
//!
//! Certificates are served through a resolver backed by an atomically
//! swappable slot, so a background task can reload cert/key from disk when
//! their mtime changes without rebuilding the listener.

use crate::config::{TlsConfig, TlsVersion};
use arc_swap::ArcSwap;
use rustls::crypto::ring;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, SupportedCipherSuite};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Cipher suite names accepted in configuration. The bare CHACHA20 names
/// are aliases for their `_SHA256` IANA spellings.
const SUPPORTED_CIPHER_SUITES: &[&str] = &[
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
];

/// Whether `name` is a cipher suite this build can negotiate.
pub fn is_supported_cipher_suite(name: &str) -> bool {
    SUPPORTED_CIPHER_SUITES.contains(&name)
}

/// TLS setup errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    #[error("unsupported TLS version: {0:?}")]
    UnsupportedVersion(TlsVersion),
}

/// Holds the rustls server configuration and reloads the certificate when
/// the files on disk change.
pub struct TlsManager {
    config: TlsConfig,
    certified: Arc<ArcSwap<CertifiedKey>>,
    server_config: Arc<ServerConfig>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl TlsManager {
    pub fn new(config: &TlsConfig) -> Result<Self, TlsError> {
        let provider = Arc::new(provider_with_suites(&config.cipher_suites));
        let certified = Arc::new(ArcSwap::from_pointee(load_certified_key(
            &provider,
            &config.cert_file,
            &config.key_file,
        )?));

        let resolver = Arc::new(SwappableCertResolver {
            certified: Arc::clone(&certified),
        });
        let server_config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&protocol_versions(config.min_version, config.max_version)?)?
            .with_no_client_auth()
            .with_cert_resolver(resolver);

        let last_modified = latest_mtime(&config.cert_file, &config.key_file);

        Ok(Self {
            config: config.clone(),
            certified,
            server_config: Arc::new(server_config),
            last_modified: Mutex::new(last_modified),
        })
    }

    /// The rustls configuration for the listener. Stable across reloads;
    /// the certificate behind it is what gets swapped.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Periodically restat cert/key and reload them when their mtime moves.
    pub async fn run_reload(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.reload_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.maybe_reload(),
                _ = shutdown.recv() => {
                    info!("certificate reloader shutting down");
                    break;
                }
            }
        }
    }

    fn maybe_reload(&self) {
        let Some(current) = latest_mtime(&self.config.cert_file, &self.config.key_file) else {
            warn!("failed to stat certificate files, skipping reload check");
            return;
        };

        let mut last = self.last_modified.lock().unwrap();
        if matches!(*last, Some(seen) if current <= seen) {
            return;
        }

        let provider = Arc::new(provider_with_suites(&self.config.cipher_suites));
        match load_certified_key(&provider, &self.config.cert_file, &self.config.key_file) {
            Ok(key) => {
                self.certified.store(Arc::new(key));
                *last = Some(current);
                info!("certificate reloaded");
            }
            Err(e) => {
                warn!(error = %e, "failed to reload certificate, keeping previous one");
            }
        }
    }
}

/// Serves whatever certificate is currently in the swappable slot.
struct SwappableCertResolver {
    certified: Arc<ArcSwap<CertifiedKey>>,
}

impl std::fmt::Debug for SwappableCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwappableCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SwappableCertResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.certified.load_full())
    }
}

/// The ring provider, with TLS 1.2 suites restricted to the configured
/// names. TLS 1.3 suites are not configurable and stay enabled.
fn provider_with_suites(names: &[String]) -> CryptoProvider {
    let mut provider = ring::default_provider();
    if names.is_empty() {
        return provider;
    }

    provider.cipher_suites.retain(|suite| match suite {
        SupportedCipherSuite::Tls13(_) => true,
        _ => {
            let id = format!("{:?}", suite.suite());
            names.iter().any(|name| suite_name_matches(name, &id))
        }
    });
    provider
}

fn suite_name_matches(config_name: &str, suite_id: &str) -> bool {
    config_name == suite_id || format!("{}_SHA256", config_name) == suite_id
}

fn protocol_versions(
    min: TlsVersion,
    max: TlsVersion,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsError> {
    let known = [
        (TlsVersion::Tls12, &rustls::version::TLS12),
        (TlsVersion::Tls13, &rustls::version::TLS13),
    ];

    let versions: Vec<_> = known
        .iter()
        .filter(|(version, _)| min <= *version && *version <= max)
        .map(|(_, supported)| *supported)
        .collect();

    if versions.is_empty() {
        return Err(TlsError::UnsupportedVersion(max));
    }
    Ok(versions)
}

fn load_certified_key(
    provider: &CryptoProvider,
    cert_path: &Path,
    key_path: &Path,
) -> Result<CertifiedKey, TlsError> {
    let open = |path: &Path| {
        File::open(path).map(BufReader::new).map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
    };

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|source| TlsError::Io {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    let signing_key = provider.key_provider.load_private_key(key)?;
    Ok(CertifiedKey::new(certs, signing_key))
}

fn latest_mtime(cert_path: &Path, key_path: &Path) -> Option<SystemTime> {
    let cert = std::fs::metadata(cert_path).and_then(|m| m.modified()).ok()?;
    let key = std::fs::metadata(key_path).and_then(|m| m.modified()).ok()?;
    Some(cert.max(key))
}
