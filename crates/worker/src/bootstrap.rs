use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use courier_core::config::{AppConfig, ConfigError, LoadOptions};
use courier_engine::{MemoryQueue, ProcessingEngine, Reconciler, TransportQueue, WorkerPool};
use courier_providers::delivery::DeliveryApi;
use courier_providers::generation::GenerationWorkflow;
use courier_providers::{
    AdaptiveLimiter, CachingResolver, CircuitBreaker, CircuitBreakerConfig, CredentialResolver,
    DeliveryAdapter, EnvCredentialResolver, GenerationAdapter, HttpDeliveryApi,
    HttpGenerationWorkflow, PollSettings, RetryPolicy,
};
use courier_store::{connect_with_settings, migrations, ConversationStore, DbPool,
    SqlConversationStore};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub queue: Arc<MemoryQueue>,
    pub pool: WorkerPool,
    pub reconciler: Reconciler,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting worker bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let store: Arc<dyn ConversationStore> =
        Arc::new(SqlConversationStore::new(db_pool.clone()));
    let queue = Arc::new(MemoryQueue::new(
        Duration::from_secs(config.queue.lease_secs),
        config.queue.max_receive_count,
    ));

    let resolver: Arc<dyn CredentialResolver> = Arc::new(CachingResolver::new(
        EnvCredentialResolver,
        Duration::from_secs(config.secrets.cache_ttl_secs),
    ));

    // One breaker and one limiter, shared by both provider surfaces and
    // every worker slot.
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let limiter = Arc::new(AdaptiveLimiter::new());

    let generation_workflow: Arc<dyn GenerationWorkflow> = Arc::new(HttpGenerationWorkflow::new(
        config.generation.base_url.clone(),
        Arc::clone(&limiter),
    ));
    let generation = GenerationAdapter::new(
        generation_workflow,
        RetryPolicy { max_retries: config.generation.max_retries, ..RetryPolicy::default() },
        Arc::clone(&breaker),
        Arc::clone(&limiter),
        PollSettings {
            initial: Duration::from_millis(config.generation.poll_initial_ms),
            max: Duration::from_millis(config.generation.poll_max_ms),
            ceiling: Duration::from_secs(config.generation.poll_ceiling_secs),
        },
        Duration::from_secs(config.generation.request_timeout_secs),
    );

    let delivery_api: Arc<dyn DeliveryApi> = Arc::new(HttpDeliveryApi::new(
        config.delivery.base_url.clone(),
        Arc::clone(&limiter),
    ));
    let delivery = DeliveryAdapter::new(
        delivery_api,
        RetryPolicy { max_retries: config.delivery.max_retries, ..RetryPolicy::default() },
        breaker,
        limiter,
        Duration::from_secs(config.delivery.request_timeout_secs),
    );

    let engine = Arc::new(ProcessingEngine::new(
        Arc::clone(&store),
        resolver,
        generation,
        config.generation.api_key.clone(),
        delivery,
        Arc::clone(&queue) as Arc<dyn TransportQueue>,
        Duration::from_secs(config.queue.heartbeat_interval_secs),
        Duration::from_secs(config.queue.heartbeat_extension_secs),
    ));

    let pool = WorkerPool::new(
        engine,
        Arc::clone(&queue) as Arc<dyn TransportQueue>,
        config.queue.worker_slots,
        Duration::from_millis(config.queue.poll_interval_ms),
    );
    let reconciler = Reconciler::new(
        store,
        Arc::clone(&queue) as Arc<dyn TransportQueue>,
        Duration::from_millis(config.queue.poll_interval_ms),
    );

    Ok(Application { config, db_pool, queue, pool, reconciler })
}
