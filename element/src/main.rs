use std::{env, sync::Arc, time::Duration};

use actix_web::{web::Data, App, HttpServer};
use core_2pc::{tm::TransactionManager, HttpCoordinatorClient, Row, TransactionCoordinator};
use element::{
    api_handlers,
    app_state::{BusinessState, ParticipantState},
    business::{BusinessService, HttpPurchaseParticipants},
    config::{ElementConfig, Role, StoreKind},
    postgres::PostgresDatabase,
    services::{ACCOUNT, ORDER, STORAGE},
    Enlistment, LocalDatabase, MemoryDatabase, ResourceManager,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<_> = env::args().collect();
    if let Err(err) = run(&args).await {
        error!(error = %err, "element stopped");
        return Err(std::io::Error::other(err));
    }
    Ok(())
}

/// Demo rows for the in-memory store: product 1 with 100 units in stock and
/// user 1 with a balance of 1000.00.
async fn seed_demo(database: &dyn LocalDatabase) -> Result<(), BoxError> {
    database
        .seed(
            &STORAGE,
            Row::new()
                .with("product_id", 1)
                .with("total", 100)
                .with("used", 0)
                .with("residue", 100),
        )
        .await?;
    database
        .seed(
            &ACCOUNT,
            Row::new()
                .with("user_id", 1)
                .with("total", 100_000)
                .with("used", 0)
                .with("residue", 100_000),
        )
        .await?;
    Ok(())
}

async fn open_database(config: &ElementConfig) -> Result<Arc<dyn LocalDatabase>, BoxError> {
    let tables = match config.role {
        Role::Storage => vec![STORAGE],
        Role::Account => vec![ACCOUNT],
        Role::Order => vec![ORDER],
        Role::Business => Vec::new(),
    };

    Ok(match config.store {
        StoreKind::Memory => {
            let database = MemoryDatabase::new(&[STORAGE, ACCOUNT, ORDER]);
            seed_demo(&database).await?;
            Arc::new(database)
        }
        StoreKind::Postgres => {
            let database = PostgresDatabase::new(config.postgres.create_pool()?, &tables);
            database.migrate().await?;
            Arc::new(database)
        }
    })
}

async fn run(args: &[String]) -> Result<(), BoxError> {
    let config = ElementConfig::from_env(args)?;
    let coordinator: Arc<dyn TransactionCoordinator> =
        Arc::new(HttpCoordinatorClient::new(config.tc_url.as_str(), REQUEST_TIMEOUT)?);
    let role = config.role;

    let participant_state = if role == Role::Business {
        None
    } else {
        let enlistment = Enlistment {
            participant: role.to_string(),
            resource: config.postgres.dbname.clone(),
            endpoint: config.endpoint.clone(),
        };
        let manager = ResourceManager::new(enlistment, coordinator.clone(), open_database(&config).await?);
        Some(Data::new(ParticipantState { manager }))
    };

    let business_state = if role == Role::Business {
        let participants = HttpPurchaseParticipants::new(
            config.storage_url.as_str(),
            config.account_url.as_str(),
            config.order_url.as_str(),
            REQUEST_TIMEOUT,
        )?;
        let service = BusinessService::new(
            TransactionManager::new(coordinator.clone(), role.as_str()),
            Arc::new(participants),
            config.purchase_timeout,
        );
        Some(Data::new(BusinessState { service }))
    } else {
        None
    };

    info!(%role, bind = %config.bind, tc = %config.tc_url, "element listening");
    HttpServer::new(move || {
        let mut app = App::new();
        if let Some(state) = &participant_state {
            app = app.app_data(state.clone());
        }
        if let Some(state) = &business_state {
            app = app.app_data(state.clone());
        }
        app.configure(api_handlers::configure(role))
    })
    .bind(config.bind.as_str())?
    .run()
    .await?;

    Ok(())
}
