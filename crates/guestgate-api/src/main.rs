//! GuestGate API server

use anyhow::Context;
use clap::Parser;
use guestgate_admission::config::DEFAULT_CONFIG_FILE;
use guestgate_admission::{
    AdmissionConfig, AdmissionPipeline, Collaborators, InMemoryKeyStore, InMemoryRateLimitStore,
    InMemoryTenantDirectory, JwksClient, TracingAuditWriter,
};
use guestgate_api::{build_router, directory, ApiState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for in-flight audit writes
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// GuestGate request-admission API
#[derive(Parser)]
#[command(name = "guestgate", version, about)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "GUESTGATE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Listen address
    #[arg(long, env = "GUESTGATE_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// JSON tenant directory seed
    #[arg(long, env = "GUESTGATE_DIRECTORY")]
    directory: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AdmissionConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let tenants = match &cli.directory {
        Some(path) => directory::load_directory(path)?,
        None => {
            warn!(
                "no tenant directory given; every organization will be reported as not onboarded"
            );
            InMemoryTenantDirectory::new()
        }
    };

    let key_source = JwksClient::new(
        &config.identity.jwks_url,
        Duration::from_millis(config.identity.fetch_timeout_ms),
    )?;

    let pipeline = Arc::new(AdmissionPipeline::from_config(
        &config,
        Collaborators {
            key_source: Arc::new(key_source),
            key_store: Arc::new(InMemoryKeyStore::new()),
            directory: Arc::new(tenants),
            rate_limit_store: Arc::new(InMemoryRateLimitStore::new()),
            audit_writer: Arc::new(TracingAuditWriter),
        },
    )?);

    let app = build_router(ApiState::new(Arc::clone(&pipeline)));

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind to {}", cli.listen))?;
    info!(addr = %cli.listen, issuer = %config.identity.issuer, "guestgate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failure")?;

    if !pipeline.audit().flush_within(AUDIT_DRAIN_TIMEOUT).await {
        warn!(
            pending = pipeline.audit().pending(),
            "audit writes still pending at shutdown; dropping them"
        );
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
