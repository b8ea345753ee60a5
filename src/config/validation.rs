//! Configuration validation.

use crate::config::{Config, SessionType, TlsVersion};
use hyper::Uri;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks backend identities and URLs, retry and breaker parameter ranges,
/// sticky-session settings, and the TLS section. Returns all problems at
/// once, joined into a single message.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    // Backends: unique non-empty ids, plain http upstream URLs.
    let mut ids = HashSet::new();
    for backend in &config.backends {
        if backend.id.is_empty() {
            errors.push("backend id cannot be empty".to_string());
        }
        if !ids.insert(backend.id.as_str()) {
            errors.push(format!("duplicate backend id: {}", backend.id));
        }
        if backend.weight == 0 {
            errors.push(format!(
                "backend '{}' has weight 0 (must be >= 1)",
                backend.id
            ));
        }

        match backend.url.parse::<Uri>() {
            Ok(uri) => {
                if uri.scheme_str() != Some("http") {
                    errors.push(format!(
                        "backend '{}' URL must use the http scheme: {}",
                        backend.id, backend.url
                    ));
                }
                if uri.authority().is_none() {
                    errors.push(format!(
                        "backend '{}' URL has no host: {}",
                        backend.id, backend.url
                    ));
                }
            }
            Err(e) => errors.push(format!(
                "backend '{}' URL is invalid: {} ({})",
                backend.id, backend.url, e
            )),
        }
    }

    // Retry parameters.
    let retry = &config.retry;
    if retry.initial_interval.is_zero() {
        errors.push("retry.initial_interval must be greater than zero".to_string());
    }
    if retry.max_interval < retry.initial_interval {
        errors.push("retry.max_interval must be >= retry.initial_interval".to_string());
    }
    if retry.multiplier <= 1.0 {
        errors.push(format!(
            "retry.multiplier must be greater than 1 (got {})",
            retry.multiplier
        ));
    }
    if !(0.0..=1.0).contains(&retry.randomization) {
        errors.push(format!(
            "retry.randomization must be within [0, 1] (got {})",
            retry.randomization
        ));
    }

    // Circuit breaker parameters.
    let breaker = &config.circuit_breaker;
    if breaker.failure_threshold == 0 {
        errors.push("circuit_breaker.failure_threshold must be >= 1".to_string());
    }
    if breaker.half_open_limit == 0 {
        errors.push("circuit_breaker.half_open_limit must be >= 1".to_string());
    }
    if breaker.reset_timeout.is_zero() {
        errors.push("circuit_breaker.reset_timeout must be greater than zero".to_string());
    }

    // Health checks.
    let health = &config.health_check;
    if !health.path.starts_with('/') {
        errors.push(format!(
            "health_check.path must start with '/' (got '{}')",
            health.path
        ));
    }
    if health.interval.is_zero() {
        errors.push("health_check.interval must be greater than zero".to_string());
    }
    if health.timeout.is_zero() {
        errors.push("health_check.timeout must be greater than zero".to_string());
    }

    // Sticky sessions.
    let sticky = &config.sticky_session;
    if sticky.enabled {
        if sticky.ttl.is_zero() {
            errors.push("sticky_session.ttl must be greater than zero".to_string());
        }
        if sticky.max_sessions == 0 {
            errors.push("sticky_session.max_sessions must be >= 1".to_string());
        }
        if sticky.cleanup_interval.is_zero() {
            errors.push("sticky_session.cleanup_interval must be greater than zero".to_string());
        }
        if sticky.session_type == SessionType::Cookie && sticky.cookie_name.is_empty() {
            errors.push("sticky_session.cookie_name cannot be empty in cookie mode".to_string());
        }
    }

    // TLS.
    let tls = &config.server.tls;
    if tls.enabled {
        if tls.cert_file.as_os_str().is_empty() {
            errors.push("server.tls.cert_file is required when TLS is enabled".to_string());
        }
        if tls.key_file.as_os_str().is_empty() {
            errors.push("server.tls.key_file is required when TLS is enabled".to_string());
        }
        if tls.min_version > tls.max_version {
            errors.push("server.tls.min_version must not exceed max_version".to_string());
        }
        if matches!(tls.min_version, TlsVersion::Tls10 | TlsVersion::Tls11) {
            errors.push(format!(
                "server.tls.min_version {:?} is not supported by the TLS stack (use TLS12 or TLS13)",
                tls.min_version
            ));
        }
        for suite in &tls.cipher_suites {
            if !crate::tls::is_supported_cipher_suite(suite) {
                errors.push(format!("unsupported cipher suite: {}", suite));
            }
        }
    }

    // Log level.
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.log.level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.log.level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn minimal_config() -> Config {
        Config {
            backends: vec![BackendConfig {
                id: "web-1".to_string(),
                url: "http://127.0.0.1:9001".to_string(),
                weight: 1,
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&minimal_config()).is_ok());
    }

    #[test]
    fn test_empty_backend_list_is_valid() {
        // An empty registry is a runtime condition (503), not a config error.
        let mut config = minimal_config();
        config.backends.clear();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_backend_id() {
        let mut config = minimal_config();
        config.backends.push(config.backends[0].clone());
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("duplicate backend id"));
    }

    #[test]
    fn test_empty_backend_id() {
        let mut config = minimal_config();
        config.backends[0].id.clear();
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("id cannot be empty"));
    }

    #[test]
    fn test_zero_weight() {
        let mut config = minimal_config();
        config.backends[0].weight = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("weight 0"));
    }

    #[test]
    fn test_https_upstream_rejected() {
        let mut config = minimal_config();
        config.backends[0].url = "https://127.0.0.1:9001".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("http scheme"));
    }

    #[test]
    fn test_schemeless_upstream_rejected() {
        let mut config = minimal_config();
        config.backends[0].url = "127.0.0.1:9001".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_retry_bounds() {
        let mut config = minimal_config();
        config.retry.multiplier = 1.0;
        config.retry.randomization = 1.5;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("multiplier"));
        assert!(err.contains("randomization"));

        let mut config = minimal_config();
        config.retry.max_interval = std::time::Duration::from_millis(10);
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("max_interval"));
    }

    #[test]
    fn test_breaker_bounds() {
        let mut config = minimal_config();
        config.circuit_breaker.failure_threshold = 0;
        config.circuit_breaker.half_open_limit = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("failure_threshold"));
        assert!(err.contains("half_open_limit"));
    }

    #[test]
    fn test_health_path_must_be_absolute() {
        let mut config = minimal_config();
        config.health_check.path = "health".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("health_check.path"));
    }

    #[test]
    fn test_sticky_session_checks_only_when_enabled() {
        let mut config = minimal_config();
        config.sticky_session.max_sessions = 0;
        assert!(validate_config(&config).is_ok());

        config.sticky_session.enabled = true;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let mut config = minimal_config();
        config.server.tls.enabled = true;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("cert_file"));
        assert!(err.contains("key_file"));
    }

    #[test]
    fn test_tls10_rejected() {
        let mut config = minimal_config();
        config.server.tls.enabled = true;
        config.server.tls.cert_file = "cert.pem".into();
        config.server.tls.key_file = "key.pem".into();
        config.server.tls.min_version = TlsVersion::Tls10;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("not supported"));
    }

    #[test]
    fn test_unknown_cipher_suite() {
        let mut config = minimal_config();
        config.server.tls.enabled = true;
        config.server.tls.cert_file = "cert.pem".into();
        config.server.tls.key_file = "key.pem".into();
        config.server.tls.cipher_suites = vec!["TLS_FANCY_SUITE".to_string()];
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("unsupported cipher suite"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = minimal_config();
        config.log.level = "verbose".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("invalid log level"));
    }
}
