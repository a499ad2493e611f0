//! The service context: everything the running process owns, in one place.

use crate::config::AppConfig;
use log::{error, info};
use qlistener_amqp::{AmqpNotifier, Consumer, ConsumerError, ConsumerHandle};
use qlistener_core::prelude::*;
use qlistener_pg::{
    MigrationError, Migrator, PgCampaignSource, PgStore, PgSubscriptionSource,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

/// Errors raised while starting or stopping the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The database is unreachable
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The schema couldn't be migrated
    #[error(transparent)]
    Migration(#[from] MigrationError),
    /// A reference cache couldn't be loaded
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// The notifier couldn't be set up or flushed
    #[error("notifier error: {0}")]
    Notifier(#[from] NotifierError),
    /// A consumer couldn't start or failed
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    /// Signal handlers couldn't be installed
    #[error("signal error: {0}")]
    Signal(#[from] std::io::Error),
}

/// The running service.
pub struct Service {
    config: AppConfig,
    pool: PgPool,
    caches: CacheRegistry,
    campaigns: Arc<ReferenceCache<PgCampaignSource>>,
    subscriptions: Arc<ReferenceCache<PgSubscriptionSource>>,
    notifier: Arc<AmqpNotifier>,
    counters: Vec<(String, Arc<ConsumerCounters>)>,
    consumers: Vec<ConsumerHandle>,
}

impl Service {
    /// Connects to the database and the broker, migrates the schema and fills the caches.
    pub async fn init(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Starting {}", config.app_name);

        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(config.database.acquire_timeout())
            .connect(&config.database.url)
            .await?;

        let applied = Migrator::new(pool.clone()).run().await?;
        info!("Applied {} migrations", applied);

        let campaigns = Arc::new(ReferenceCache::new(PgCampaignSource::new(pool.clone())));
        let subscriptions = Arc::new(ReferenceCache::new(PgSubscriptionSource::new(
            pool.clone(),
        )));
        let mut caches = CacheRegistry::new();
        caches.register(campaigns.clone());
        caches.register(subscriptions.clone());
        caches.reload_all().await?;

        let notifier =
            Arc::new(AmqpNotifier::connect(&config.amqp.url, config.notifier.clone()).await?);

        Ok(Self {
            config,
            pool,
            caches,
            campaigns,
            subscriptions,
            notifier,
            counters: Vec::new(),
            consumers: Vec::new(),
        })
    }

    /// Starts the consumers of every enabled queue.
    pub async fn start_consumers(&mut self) -> Result<(), ServiceError> {
        let queue = self.config.queues.mt_manager.clone();
        let manager = MtManager::new(PgStore::new(self.pool.clone()), self.notifier.clone());
        let dispatcher = Dispatcher::new(queue.name.clone(), manager);
        self.counters.push((queue.name.clone(), dispatcher.counters()));

        let consumer = Consumer::new(self.config.amqp.url.clone(), queue)
            .with_tag_prefix(self.config.app_name.clone())
            .with_retry_policy(self.config.amqp.retry_policy());
        if let Some(handle) = consumer.start(Arc::new(dispatcher)).await? {
            self.consumers.push(handle);
        }
        Ok(())
    }

    /// The configuration the service runs with.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Active campaigns by hash.
    pub fn campaigns(&self) -> &ReferenceCache<PgCampaignSource> {
        &self.campaigns
    }

    /// Active subscriptions by msisdn and service code.
    pub fn subscriptions(&self) -> &ReferenceCache<PgSubscriptionSource> {
        &self.subscriptions
    }

    /// Reloads the cache of one table.
    pub async fn reload_table(&self, table: &str) -> Result<usize, CacheError> {
        self.caches.reload(table).await
    }

    /// Reloads every cache.
    pub async fn reload_all(&self) -> Result<(), CacheError> {
        self.caches.reload_all().await
    }

    /// Current counters of every consumed queue.
    pub fn counters(&self) -> Vec<(String, CountersSnapshot)> {
        self.counters
            .iter()
            .map(|(queue, counters)| (queue.clone(), counters.snapshot()))
            .collect()
    }

    /// Resolves when a consumer stops with a fatal error. Never resolves without consumers.
    pub async fn failed(&mut self) {
        if self.consumers.is_empty() {
            return std::future::pending().await;
        }
        let waits = self.consumers.iter_mut().map(|c| Box::pin(c.failed()));
        futures::future::select_all(waits).await;
    }

    /// Stops the consumers, flushes the notifier and closes the pool.
    ///
    /// Every step runs even if an earlier one fails; the first error is returned.
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        let mut first_error: Option<ServiceError> = None;

        for consumer in self.consumers {
            let queue = consumer.queue().to_string();
            if let Err(e) = consumer.shutdown().await {
                error!("[{}] stopped with error: {}", queue, e);
                first_error.get_or_insert(e.into());
            }
        }
        for (queue, counters) in &self.counters {
            info!("[{}] counters: {:?}", queue, counters.snapshot());
        }

        if let Err(e) = self.notifier.flush().await {
            error!("Failed to flush notifier: {}", e);
            first_error.get_or_insert(e.into());
        }
        self.notifier.close().await;
        self.pool.close().await;

        info!("{} stopped", self.config.app_name);
        first_error.map_or(Ok(()), Err)
    }
}
