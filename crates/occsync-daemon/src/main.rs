//! Daemon entrypoint: configuration, wiring, serve loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use occsync_core::config::OccsyncConfig;
use occsync_core::couch::{CouchClient, DocumentStore};
use occsync_daemon::directory::Directory;
use occsync_daemon::handlers;
use occsync_daemon::identity::TokenVerifier;
use occsync_daemon::reconcile::Reconciler;
use occsync_daemon::state::AppState;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "occsync-daemon", about = "Occurrence sync bridge daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "occsync.toml")]
    config: PathBuf,

    /// Run the tenant-database repair sweep and exit instead of serving.
    #[arg(long)]
    repair: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = if args.config.exists() {
        OccsyncConfig::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        OccsyncConfig::default()
    };

    // Secrets resolve exactly once, before anything is served. A missing
    // secret is fatal here rather than a 500 later.
    let couch_secrets = config.couchdb.resolve().context("resolving document-store secrets")?;
    let auth_secret = config
        .server
        .resolve_auth_secret()
        .context("resolving auth signing secret")?;

    let directory =
        Directory::open(&config.database.path).context("opening relational store")?;

    let store: Arc<dyn DocumentStore> = Arc::new(
        CouchClient::new(
            &config.couchdb.url,
            &config.couchdb.admin_user,
            &couch_secrets.admin_pass,
            &config.couchdb.db_prefix,
            Duration::from_secs(config.couchdb.timeout_secs),
        )
        .context("building document-store client")?,
    );

    let state = AppState::new(
        directory.clone(),
        Arc::clone(&store),
        TokenVerifier::new(auth_secret),
        reqwest::Client::new(),
        config.couchdb.url.clone(),
        couch_secrets.proxy_secret,
    );

    if args.repair {
        let report = state.provisioner.ensure_all_databases().await?;
        info!(ensured = report.ensured, failed = report.failed, "repair complete");
        anyhow::ensure!(report.failed == 0, "{} tenant databases failed to repair", report.failed);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler_handle = if config.reconciler.enabled {
        let reconciler = Reconciler::new(
            directory,
            store,
            Duration::from_secs(config.reconciler.poll_interval_secs),
        );
        Some(tokio::spawn(async move { reconciler.run(shutdown_rx).await }))
    } else {
        info!("reconciler disabled by configuration");
        None
    };

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "listening");

    axum::serve(listener, handlers::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Let an in-flight reconcile cycle finish before exiting.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = reconciler_handle {
        handle.await.context("reconciler task panicked")?;
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}
