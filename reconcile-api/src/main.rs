use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use reconcile_api::config::Config;
use reconcile_api::handlers::AppState;
use reconcile_api::router::router;
use reconcile_common::reconciler::Reconciler;
use reconcile_common::store::{DocumentStore, MemoryStore, PgStore};

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

async fn create_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    match config.store_backend.as_str() {
        "postgres" => {
            let store = PgStore::connect(
                &config.database_url,
                config.max_pg_connections,
                config.acquire_timeout(),
            )
            .await?;

            if config.run_migrations {
                store.migrate().await?;
                tracing::info!("Applied record table migrations");
            }

            tracing::info!("Created Postgres store backend");
            Ok(Arc::new(store))
        }
        "memory" => {
            tracing::warn!("Using in-memory store backend, records are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        other => Err(eyre::eyre!(
            "Unknown store backend: {other}. Supported: postgres, memory"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().expect("Invalid configuration:");

    let log_layer = fmt::layer()
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(log_layer)
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    tracing::info!("Starting reconcile api");
    tracing::info!("Store backend: {}", config.store_backend);

    let store = create_store(&config).await?;
    // Identity locks are held in this process, so a store must only be served by one instance.
    let reconciler = Reconciler::new(store, config.store_timeout());

    let app = router(
        AppState::new(reconciler),
        config.max_body_size,
        config.concurrency_limit,
        config.export_prometheus,
    );

    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
