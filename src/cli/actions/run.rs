use crate::{
    api::{self, ApiContext, shutdown::shutdown_signal},
    cli::{
        actions::{Action, RunConfig, init_schema},
        telemetry::shutdown_tracer,
    },
    collectors::postgres::PgConnector,
    metrics,
    store::{self, KEYSTORE_FILE, KeyStore, PROFILES_FILE, ProfileStore},
    supervisor::{CollectorSupervisor, LogQueue, LogSink},
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Handle the action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run { config, log_queue } => run(config, log_queue).await?,
        Action::InitSchema { dsn } => init_schema::handle(dsn).await?,
    }

    Ok(())
}

async fn run(config: RunConfig, log_queue: LogQueue) -> Result<()> {
    metrics::init();

    let profiles = ProfileStore::open(
        config.security_dir.join(PROFILES_FILE),
        &config.config_secret,
    )
    .context("Failed to open the profile store")?;

    let keys = KeyStore::open(
        config.security_dir.join(KEYSTORE_FILE),
        &config.config_secret,
    )
    .context("Failed to open the keystore")?;

    let (listener, addr) = api::bind(config.port, config.listen).await?;

    let log_sink = LogSink::start(log_queue, config.log_file)?;

    let (store, store_thread) = store::handle::spawn(profiles)?;

    let supervisor = CollectorSupervisor::new(
        store.clone(),
        Arc::new(PgConnector::default()),
        config.collect_interval,
        Some(log_sink),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(supervisor.run(config.check_interval, shutdown_rx));

    println!(
        "{} {} - Listening on {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        addr
    );

    let ctx = ApiContext::new(store, keys, config.apikeygen_secret);
    let served = api::serve(listener, ctx, shutdown_signal()).await;

    info!("shutting down");

    let _ = shutdown_tx.send(true);

    if let Err(e) = supervisor.await {
        error!(error = %e, "collector supervisor ended abnormally");
    }

    // the store thread exits once the last handle is gone
    match tokio::task::spawn_blocking(move || store_thread.join()).await {
        Ok(Ok(())) => {}
        _ => error!("profile store thread ended abnormally"),
    }

    shutdown_tracer();

    served
}
