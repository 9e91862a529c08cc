//! Stafette event backbone service.
//!
//! Runs the backbone process: the outbox dispatcher draining committed
//! events to the broker, and the admin server exposing replay operations
//! and the readiness probe. Producer services append events through
//! `PgOutboxStore::append_in_tx` inside their own transactions;
//! subscriber services embed `ConsumerRuntime` per queue.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stafette_admin::{AppState, Config};
use stafette_broker::amqp::AmqpBroker;
use stafette_core::time::RealClock;
use stafette_outbox::{BackoffPolicy, Dispatcher, PgOutboxStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting stafette event backbone");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        broker_url = %config.broker_url_masked(),
        dispatcher_interval_ms = config.dispatcher_interval_ms,
        dispatcher_batch_size = config.dispatcher_batch_size,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    PgOutboxStore::migrate(&pool).await.context("outbox schema bootstrap failed")?;
    info!("outbox schema ready");

    let clock = Arc::new(RealClock);
    let store = Arc::new(PgOutboxStore::with_policy(
        pool.clone(),
        BackoffPolicy::default(),
        clock.clone(),
    ));

    let broker = Arc::new(
        AmqpBroker::connect(&config.broker_url, "stafette")
            .await
            .context("broker connection failed")?,
    );

    let shutdown = CancellationToken::new();

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        broker.clone(),
        config.to_dispatcher_config(),
        clock,
        shutdown.child_token(),
    ));
    let dispatcher_task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run().await }
    });

    let state = AppState::new(store, broker, config.dispatcher_max_retries);
    let server_task = tokio::spawn(stafette_admin::start_server(
        state,
        config.server_addr()?,
        Duration::from_secs(config.request_timeout),
        shutdown.child_token(),
    ));

    info!("stafette event backbone is up");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");
    shutdown.cancel();

    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(30)) => {
            warn!("shutdown grace period expired");
        }
        (dispatcher_result, server_result) = async { tokio::join!(dispatcher_task, server_task) } => {
            if let Err(e) = dispatcher_result {
                warn!(error = %e, "dispatcher task ended abnormally");
            }
            match server_result {
                Ok(Err(e)) => warn!(error = %e, "admin server ended with error"),
                Err(e) => warn!(error = %e, "admin server task ended abnormally"),
                Ok(Ok(())) => {},
            }
        }
    }

    pool.close().await;
    info!("stafette shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based filtering.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,stafette=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database pool, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(_) if retries < MAX_RETRIES => {
                retries += 1;
                info!(attempt = retries, max_retries = MAX_RETRIES, "database not ready, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C");
        },
        () = terminate => {
            info!("received SIGTERM");
        },
    }
}
