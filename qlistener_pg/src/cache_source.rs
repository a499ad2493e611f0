use async_trait::async_trait;
use qlistener_core::cache::{CAMPAIGNS_TABLE, SUBSCRIPTIONS_TABLE};
use qlistener_core::prelude::*;
use sqlx::PgPool;

/// Value of the `status` column marking a row as active.
pub const ACTIVE: i32 = 1;

/// Loads active campaigns keyed by hash.
#[derive(Debug, Clone)]
pub struct PgCampaignSource {
    pool: PgPool,
}

impl PgCampaignSource {
    /// Creates a new source over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheSource for PgCampaignSource {
    type Key = String;
    type Value = CampaignEntry;
    type Error = sqlx::Error;

    fn table(&self) -> &str {
        CAMPAIGNS_TABLE
    }

    async fn load(&self) -> Result<Vec<(String, CampaignEntry)>, sqlx::Error> {
        let rows: Vec<(i64, String, i64)> =
            sqlx::query_as("SELECT id, hash, service_id_1 FROM campaigns WHERE status = $1")
                .bind(ACTIVE)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, hash, service_id)| {
                (
                    hash.clone(),
                    CampaignEntry {
                        hash,
                        id,
                        service_id,
                    },
                )
            })
            .collect())
    }
}

/// Loads active subscriptions keyed by msisdn and service code.
#[derive(Debug, Clone)]
pub struct PgSubscriptionSource {
    pool: PgPool,
}

impl PgSubscriptionSource {
    /// Creates a new source over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheSource for PgSubscriptionSource {
    type Key = SubscriptionKey;
    type Value = i64;
    type Error = sqlx::Error;

    fn table(&self) -> &str {
        SUBSCRIPTIONS_TABLE
    }

    async fn load(&self) -> Result<Vec<(SubscriptionKey, i64)>, sqlx::Error> {
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, msisdn, id_service FROM subscriptions WHERE status = $1")
                .bind(ACTIVE)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, msisdn, service_code)| (SubscriptionKey::new(msisdn, service_code), id))
            .collect())
    }
}
