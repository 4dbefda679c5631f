use std::{sync::Arc, time::Duration};

use actix_web::{web::Data, App, HttpServer};
use coordinator::{
    api_handlers,
    app_state::AppState,
    config::{CoordinatorConfig, StoreKind},
    postgres::PostgresTransactionStore,
    Coordinator, HttpParticipantClient, MemoryTransactionStore, TransactionStore,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DECIDE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run().await {
        error!(error = %err, "coordinator stopped");
        return Err(std::io::Error::other(err));
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = CoordinatorConfig::from_env()?;

    let store: Arc<dyn TransactionStore> = match config.store {
        StoreKind::Memory => Arc::new(MemoryTransactionStore::new()),
        StoreKind::Postgres => {
            let store = PostgresTransactionStore::new(config.postgres.create_pool()?);
            store.migrate().await?;
            Arc::new(store)
        }
    };
    let participants = Arc::new(HttpParticipantClient::new(DECIDE_REQUEST_TIMEOUT)?);

    let coordinator = Coordinator::recover(store, participants, config.options()).await?;
    coordinator.spawn_timeout_sweeper();

    info!(bind = %config.bind, store = ?config.store, "coordinator listening");
    let state = Data::new(AppState::new(coordinator.clone()));
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api_handlers::configure)
    })
    .bind(config.bind.as_str())?
    .run()
    .await?;

    coordinator.shutdown();
    Ok(())
}
