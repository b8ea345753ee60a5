//! gantry - a Layer 7 reverse-proxy load balancer
//!
//! Usage:
//!     gantry --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use gantry::backend::Backend;
use gantry::balancer;
use gantry::config::{load_config, Config};
use gantry::health::{HealthScheduler, HttpProbe};
use gantry::metrics::Metrics;
use gantry::proxy::{Forwarder, Server};
use gantry::session::SessionManager;
use gantry::tls::TlsManager;
use gantry::util::{init_logging, wait_for_signal, ShutdownSignal};

/// A Layer 7 reverse-proxy load balancer.
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides the configured log level.
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    init_logging(log_level, &config.log.format);

    if cli.validate {
        println!("Configuration is valid.");
        println!("  Port: {}", config.server.port);
        println!("  Algorithm: {:?}", config.algorithm);
        println!("  Backends: {}", config.backends.len());
        for backend in &config.backends {
            println!("    - {} -> {} (weight {})", backend.id, backend.url, backend.weight);
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        algorithm = ?config.algorithm,
        backends = config.backends.len(),
        "gantry starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let metrics = Metrics::new();
    let shutdown = ShutdownSignal::new();

    // Registry and selection policy.
    let selector = balancer::new_selector(&config.algorithm);
    let scheduler = Arc::new(HealthScheduler::new(
        config.health_check.interval,
        config.health_check.timeout,
        metrics.clone(),
    ));

    for backend_cfg in &config.backends {
        let upstream = backend_cfg
            .url
            .parse()
            .with_context(|| format!("invalid upstream URL for backend '{}'", backend_cfg.id))?;
        let backend = Arc::new(Backend::new(
            &backend_cfg.id,
            upstream,
            backend_cfg.weight,
            config.breaker_config(),
            config.retry_policy(),
        ));

        let probe = Arc::new(HttpProbe::new(
            backend.upstream().clone(),
            config.health_check.path.clone(),
            config.health_check.timeout,
        ));

        selector.add(&backend_cfg.id, Arc::clone(&backend));
        scheduler.add(&backend_cfg.id, backend, probe);

        info!(
            backend = %backend_cfg.id,
            url = %backend_cfg.url,
            weight = backend_cfg.weight,
            "registered backend"
        );
    }

    // Log health transitions from the scheduler's result stream.
    if let Some(mut results) = scheduler.results() {
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                if !result.ok {
                    warn!(
                        backend = %result.backend_id,
                        error = result.error.as_deref().unwrap_or("unknown"),
                        latency_ms = result.latency.as_millis(),
                        "backend unhealthy"
                    );
                }
            }
        });
    }
    scheduler.start();

    // Sticky sessions.
    let session = Arc::new(SessionManager::new(config.sticky_session.clone()));
    session.start();

    // TLS termination with certificate hot-reload.
    let tls_manager = if config.server.tls.enabled {
        let manager = Arc::new(TlsManager::new(&config.server.tls).context("failed to set up TLS")?);
        tokio::spawn(Arc::clone(&manager).run_reload(shutdown.subscribe()));
        Some(manager)
    } else {
        None
    };

    // Front server.
    let forwarder = Arc::new(Forwarder::new(
        selector,
        Arc::clone(&session),
        metrics,
    ));
    let addr: SocketAddr = ([0, 0, 0, 0], config.server.port).into();
    let server = Server::bind(addr, forwarder, tls_manager.as_deref())
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let server_handle = tokio::spawn(server.run(shutdown.subscribe()));
    info!(port = config.server.port, "gantry is running, press Ctrl+C to stop");

    wait_for_signal().await;
    info!("shutting down");

    shutdown.shutdown();
    scheduler.stop().await;
    session.stop();
    server_handle.await.context("server task panicked")?;

    info!("gantry exited cleanly");
    Ok(())
}
