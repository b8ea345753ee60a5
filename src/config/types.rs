//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,

    /// Load balancing algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Sticky session settings
    #[serde(default)]
    pub sticky_session: StickySessionConfig,

    /// Health check probe settings
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Circuit breaker settings, applied per backend
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry settings, applied per backend
    #[serde(default)]
    pub retry: RetryConfig,

    /// Backend registry at startup
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl Config {
    /// Breaker configuration in the form the backend module consumes.
    pub fn breaker_config(&self) -> crate::backend::BreakerConfig {
        crate::backend::BreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            reset_timeout: self.circuit_breaker.reset_timeout,
            half_open_limit: self.circuit_breaker.half_open_limit,
        }
    }

    /// Retry policy in the form the retry executor consumes.
    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_interval: self.retry.initial_interval,
            max_interval: self.retry.max_interval,
            multiplier: self.retry.multiplier,
            randomization: self.retry.randomization,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// TCP port to bind
    #[serde(default = "default_port")]
    pub port: u16,

    /// TLS termination settings
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            tls: TlsConfig::default(),
        }
    }
}

/// TLS termination configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Serve TLS instead of plaintext
    #[serde(default)]
    pub enabled: bool,

    /// PEM certificate chain
    #[serde(default)]
    pub cert_file: PathBuf,

    /// PEM private key
    #[serde(default)]
    pub key_file: PathBuf,

    /// How often to restat and reload cert/key if changed
    #[serde(default = "default_tls_reload_interval", with = "humantime_serde")]
    pub reload_interval: Duration,

    /// Lowest negotiated protocol version
    #[serde(default = "default_tls_min_version")]
    pub min_version: TlsVersion,

    /// Highest negotiated protocol version
    #[serde(default = "default_tls_max_version")]
    pub max_version: TlsVersion,

    /// Allowed cipher suites by name; empty means the stack default
    #[serde(default)]
    pub cipher_suites: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: PathBuf::new(),
            key_file: PathBuf::new(),
            reload_interval: default_tls_reload_interval(),
            min_version: default_tls_min_version(),
            max_version: default_tls_max_version(),
            cipher_suites: Vec::new(),
        }
    }
}

/// Negotiable TLS protocol version.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    #[serde(rename = "TLS10")]
    Tls10,
    #[serde(rename = "TLS11")]
    Tls11,
    #[serde(rename = "TLS12")]
    Tls12,
    #[serde(rename = "TLS13")]
    Tls13,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Load balancing algorithm.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    WeightedRoundRobin,
}

/// Sticky session configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StickySessionConfig {
    /// Whether sticky sessions are enabled
    #[serde(default)]
    pub enabled: bool,

    /// Client identity: ip or cookie
    #[serde(default, rename = "type")]
    pub session_type: SessionType,

    /// Cookie name for cookie-based sessions
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Session lifetime
    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum live session entries
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// How often the sweeper removes expired entries
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            session_type: SessionType::default(),
            cookie_name: default_cookie_name(),
            ttl: default_session_ttl(),
            max_sessions: default_max_sessions(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

/// How clients are identified for sticky sessions.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    #[default]
    Ip,
    Cookie,
}

/// Health check probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Path probed on each backend
    #[serde(default = "default_health_path")]
    pub path: String,

    /// How often each backend is probed
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Deadline for a single probe
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open breaker rejects before probing
    #[serde(default = "default_reset_timeout", with = "humantime_serde")]
    pub reset_timeout: Duration,

    /// Concurrent probe cap in the half-open state
    #[serde(default = "default_half_open_limit")]
    pub half_open_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
            half_open_limit: default_half_open_limit(),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before the first retry
    #[serde(default = "default_initial_interval", with = "humantime_serde")]
    pub initial_interval: Duration,

    /// Upper bound on any single backoff
    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,

    /// Backoff growth factor
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter range in [0, 1]
    #[serde(default = "default_randomization")]
    pub randomization: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            multiplier: default_multiplier(),
            randomization: default_randomization(),
        }
    }
}

/// One backend registry entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Opaque id, unique within the process
    pub id: String,

    /// Absolute upstream URL
    pub url: String,

    /// Weight for weighted round-robin (default: 1)
    #[serde(default = "default_weight")]
    pub weight: u32,
}

// Default value functions
fn default_port() -> u16 {
    8080
}

fn default_tls_reload_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_tls_min_version() -> TlsVersion {
    TlsVersion::Tls12
}

fn default_tls_max_version() -> TlsVersion {
    TlsVersion::Tls13
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cookie_name() -> String {
    "lb_session".to_string()
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_limit() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_randomization() -> f64 {
    0.1
}

fn default_weight() -> u32 {
    1
}

/// Custom serde module for humantime durations ("100ms", "30s", "1h").
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
