use anyhow::Context;
use movemate_api::{app, worker, AppState, AuthConfig};
use movemate_core::SystemClock;
use movemate_shipment::{Collaborators, LifecycleOrchestrator};
use movemate_store::{
    Config, DbClient, EventProducer, KafkaDocumentRequester, KafkaNotificationSink, PgDriverDirectory,
    PgLifecycleStore, RateTablePricing, RedisDispatchQueue,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "movemate_api=debug,movemate_shipment=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting MoveMate API on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    // Redis dispatch queue
    let queue = RedisDispatchQueue::new(
        &config.redis.url,
        &config.redis.queue_prefix,
        chrono::Duration::seconds(config.worker.visibility_timeout_seconds),
    )
    .context("Failed to create Redis client")?;

    // Kafka
    let producer = EventProducer::new(&config.kafka.brokers).context("Failed to create Kafka producer")?;

    let collaborators = Collaborators {
        pricing: Arc::new(RateTablePricing::new(config.pricing.clone())),
        notifier: Arc::new(KafkaNotificationSink::new(producer.clone(), config.kafka.topics.clone())),
        documents: Arc::new(KafkaDocumentRequester::new(producer, &config.kafka.topics.documents)),
        drivers: Arc::new(PgDriverDirectory::new(db.pool.clone())),
    };

    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        Arc::new(PgLifecycleStore::new(db.pool.clone())),
        Arc::new(queue),
        collaborators,
        Arc::new(SystemClock),
        config.lifecycle.clone(),
    ));

    tokio::spawn(worker::start_dispatch_worker(orchestrator.clone(), config.worker.clone()));
    tokio::spawn(worker::start_billing_sweeper(orchestrator.clone(), config.worker.clone()));
    tokio::spawn(worker::start_matching_reconciler(orchestrator.clone(), config.worker.clone()));

    let app_state = AppState {
        orchestrator,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(app_state)).await?;
    Ok(())
}
