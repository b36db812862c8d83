// Fuseline broker server

use std::sync::Arc;

use anyhow::{Context, Result};
use fuseline_broker::{AppState, Broker};
use fuseline_storage::{MemoryRuntimeStorage, PostgresRuntimeStorage, RuntimeStorage};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("fuseline-broker starting...");

    let store: Arc<dyn RuntimeStorage> = match std::env::var("DATABASE_URL") {
        Ok(dsn) => {
            let storage = PostgresRuntimeStorage::connect(&dsn)
                .await
                .context("failed to connect to database")?;
            tracing::info!("connected to PostgreSQL runtime storage");
            Arc::new(storage)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; runtime state is in-memory only");
            Arc::new(MemoryRuntimeStorage::new())
        }
    };

    let mut broker = Broker::new(store);
    if let Ok(ttl) = std::env::var("WORKER_TTL_SECS") {
        let ttl: u64 = ttl.parse().context("WORKER_TTL_SECS must be an integer")?;
        broker = broker.with_worker_ttl(std::time::Duration::from_secs(ttl));
    }

    let state = AppState {
        broker: Arc::new(broker),
    };
    let app = fuseline_broker::router(state);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "8000".to_string());
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {addr}");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
