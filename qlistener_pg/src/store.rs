use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qlistener_core::prelude::*;
use sqlx::PgPool;

/// Errors returned by the [`PgStore`].
#[derive(Debug, thiserror::Error)]
pub enum PgStoreError {
    /// A statement failed. Carries the statement so it ends up in the logs.
    #[error("{source}; statement: {statement}")]
    Query {
        /// The failing statement
        statement: &'static str,
        /// The driver error
        #[source]
        source: sqlx::Error,
    },
}

fn failed(statement: &'static str) -> impl FnOnce(sqlx::Error) -> PgStoreError {
    move |source| PgStoreError::Query { statement, source }
}

const BEGIN: &str = "BEGIN";
const COMMIT: &str = "COMMIT";

const INSERT_RETRY: &str = r#"
    INSERT INTO retries
        (tid, keep_days, delay_hours, msisdn, operator_code, country_code,
         id_service, id_subscription, id_campaign, price)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    RETURNING id
"#;

const TOUCH_RETRY: &str = r#"
    UPDATE retries
    SET status = '', attempts_count = attempts_count + 1, last_pay_attempt_at = $2
    WHERE id = $1
"#;

const ARCHIVE_RETRY: &str = r#"
    INSERT INTO retries_expired
        (id, tid, id_subscription, id_campaign, id_service, msisdn, operator_code,
         country_code, keep_days, delay_hours, price, status, attempts_count,
         created_at, last_pay_attempt_at)
    SELECT id, tid, id_subscription, id_campaign, id_service, msisdn, operator_code,
         country_code, keep_days, delay_hours, price, status, attempts_count,
         created_at, last_pay_attempt_at
    FROM retries
    WHERE id = $1
"#;

const DELETE_RETRY: &str = "DELETE FROM retries WHERE id = $1";

const WRITE_SUBSCRIPTION_STATUS: &str = r#"
    UPDATE subscriptions
    SET result = $2, attempts_count = attempts_count + 1, last_pay_attempt_at = $3
    WHERE id = $1
"#;

const WRITE_SUBSCRIPTION_PERIODIC: &str = "UPDATE subscriptions SET periodic = $2 WHERE id = $1";

const SELECT_LATEST_SUBSCRIPTION: &str = r#"
    SELECT id FROM subscriptions
    WHERE msisdn = $1 AND id_service = $2 AND result <> $3
    ORDER BY id DESC
    LIMIT 1
    FOR UPDATE
"#;

const CANCEL_SUBSCRIPTION: &str = r#"
    UPDATE subscriptions
    SET result = $2, attempts_count = attempts_count + 1, last_pay_attempt_at = $3
    WHERE id = $1
    RETURNING id, id_campaign, operator_code, attempts_count
"#;

const SELECT_PURGEABLE_SUBSCRIPTIONS: &str = r#"
    SELECT id FROM subscriptions
    WHERE msisdn = $1 AND NOT (result = ANY($2))
    ORDER BY id
    FOR UPDATE
"#;

const PURGE_SUBSCRIPTIONS: &str = r#"
    UPDATE subscriptions
    SET result = $2, outflow_reason = $3, last_pay_attempt_at = $4
    WHERE id = ANY($1)
    RETURNING id, id_campaign, operator_code, attempts_count
"#;

const INSERT_BLACKLISTED: &str = "INSERT INTO msisdn_blacklist (msisdn) VALUES ($1)";

const INSERT_POSTPAID: &str = "INSERT INTO msisdn_postpaid (msisdn) VALUES ($1)";

const INSERT_TRANSACTION: &str = r#"
    INSERT INTO transactions
        (tid, sent_at, msisdn, result, operator_code, country_code, id_service,
         id_subscription, id_campaign, operator_token, price)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

#[derive(sqlx::FromRow)]
struct AffectedRow {
    id: i64,
    id_campaign: String,
    operator_code: i64,
    attempts_count: i32,
}

impl From<AffectedRow> for AffectedSubscription {
    fn from(row: AffectedRow) -> Self {
        Self {
            id: row.id,
            campaign_code: row.id_campaign,
            operator_code: row.operator_code,
            attempts_count: row.attempts_count,
        }
    }
}

/// Subscription store implementation for postgres.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a new `PgStore` over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    type Error = PgStoreError;

    async fn insert_retry(&self, retry: &NewRetry) -> Result<i64, Self::Error> {
        let (id,): (i64,) = sqlx::query_as(INSERT_RETRY)
            .bind(&retry.tid)
            .bind(retry.keep_days)
            .bind(retry.delay_hours)
            .bind(&retry.msisdn)
            .bind(retry.operator_code)
            .bind(retry.country_code)
            .bind(&retry.service_code)
            .bind(retry.subscription_id)
            .bind(&retry.campaign_code)
            .bind(retry.price)
            .fetch_one(&self.pool)
            .await
            .map_err(failed(INSERT_RETRY))?;
        Ok(id)
    }

    async fn touch_retry(
        &self,
        retry_id: i64,
        attempted_at: DateTime<Utc>,
    ) -> Result<u64, Self::Error> {
        let result = sqlx::query(TOUCH_RETRY)
            .bind(retry_id)
            .bind(attempted_at)
            .execute(&self.pool)
            .await
            .map_err(failed(TOUCH_RETRY))?;
        Ok(result.rows_affected())
    }

    async fn remove_retry(&self, retry_id: i64, archive: bool) -> Result<u64, Self::Error> {
        let mut tx = self.pool.begin().await.map_err(failed(BEGIN))?;

        if archive {
            let archived = sqlx::query(ARCHIVE_RETRY)
                .bind(retry_id)
                .execute(&mut *tx)
                .await
                .map_err(failed(ARCHIVE_RETRY))?;
            log::debug!(
                "Archived {} row(s) of retry {}",
                archived.rows_affected(),
                retry_id
            );
        }

        let deleted = sqlx::query(DELETE_RETRY)
            .bind(retry_id)
            .execute(&mut *tx)
            .await
            .map_err(failed(DELETE_RETRY))?;

        tx.commit().await.map_err(failed(COMMIT))?;
        Ok(deleted.rows_affected())
    }

    async fn write_subscription_status(
        &self,
        subscription_id: i64,
        status: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<u64, Self::Error> {
        let result = sqlx::query(WRITE_SUBSCRIPTION_STATUS)
            .bind(subscription_id)
            .bind(status)
            .bind(attempted_at)
            .execute(&self.pool)
            .await
            .map_err(failed(WRITE_SUBSCRIPTION_STATUS))?;
        Ok(result.rows_affected())
    }

    async fn write_subscription_periodic(
        &self,
        subscription_id: i64,
        periodic: bool,
    ) -> Result<u64, Self::Error> {
        let result = sqlx::query(WRITE_SUBSCRIPTION_PERIODIC)
            .bind(subscription_id)
            .bind(periodic)
            .execute(&self.pool)
            .await
            .map_err(failed(WRITE_SUBSCRIPTION_PERIODIC))?;
        Ok(result.rows_affected())
    }

    async fn unsubscribe(
        &self,
        msisdn: &str,
        service_code: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<Option<AffectedSubscription>, Self::Error> {
        let mut tx = self.pool.begin().await.map_err(failed(BEGIN))?;

        let latest: Option<(i64,)> = sqlx::query_as(SELECT_LATEST_SUBSCRIPTION)
            .bind(msisdn)
            .bind(service_code)
            .bind(status::CANCELED)
            .fetch_optional(&mut *tx)
            .await
            .map_err(failed(SELECT_LATEST_SUBSCRIPTION))?;

        let Some((id,)) = latest else {
            tx.commit().await.map_err(failed(COMMIT))?;
            return Ok(None);
        };

        let row: AffectedRow = sqlx::query_as(CANCEL_SUBSCRIPTION)
            .bind(id)
            .bind(status::CANCELED)
            .bind(attempted_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(failed(CANCEL_SUBSCRIPTION))?;

        tx.commit().await.map_err(failed(COMMIT))?;
        Ok(Some(row.into()))
    }

    async fn unsubscribe_all(
        &self,
        msisdn: &str,
        reason: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<Vec<AffectedSubscription>, Self::Error> {
        let terminal: Vec<String> = status::TERMINAL.iter().map(|s| s.to_string()).collect();
        let mut tx = self.pool.begin().await.map_err(failed(BEGIN))?;

        let ids: Vec<i64> = sqlx::query_scalar(SELECT_PURGEABLE_SUBSCRIPTIONS)
            .bind(msisdn)
            .bind(&terminal)
            .fetch_all(&mut *tx)
            .await
            .map_err(failed(SELECT_PURGEABLE_SUBSCRIPTIONS))?;

        if ids.is_empty() {
            tx.commit().await.map_err(failed(COMMIT))?;
            return Ok(Vec::new());
        }

        let mut rows: Vec<AffectedRow> = sqlx::query_as(PURGE_SUBSCRIPTIONS)
            .bind(&ids)
            .bind(status::PURGED)
            .bind(reason)
            .bind(attempted_at)
            .fetch_all(&mut *tx)
            .await
            .map_err(failed(PURGE_SUBSCRIPTIONS))?;

        tx.commit().await.map_err(failed(COMMIT))?;

        rows.sort_by_key(|row| row.id);
        Ok(rows.into_iter().map(AffectedSubscription::from).collect())
    }

    async fn add_blacklisted_number(&self, msisdn: &str) -> Result<(), Self::Error> {
        sqlx::query(INSERT_BLACKLISTED)
            .bind(msisdn)
            .execute(&self.pool)
            .await
            .map_err(failed(INSERT_BLACKLISTED))?;
        Ok(())
    }

    async fn add_postpaid_number(&self, msisdn: &str) -> Result<(), Self::Error> {
        sqlx::query(INSERT_POSTPAID)
            .bind(msisdn)
            .execute(&self.pool)
            .await
            .map_err(failed(INSERT_POSTPAID))?;
        Ok(())
    }

    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<(), Self::Error> {
        sqlx::query(INSERT_TRANSACTION)
            .bind(&transaction.tid)
            .bind(transaction.sent_at)
            .bind(&transaction.msisdn)
            .bind(&transaction.result)
            .bind(transaction.operator_code)
            .bind(transaction.country_code)
            .bind(&transaction.service_code)
            .bind(transaction.subscription_id)
            .bind(&transaction.campaign_code)
            .bind(&transaction.operator_token)
            .bind(transaction.price)
            .execute(&self.pool)
            .await
            .map_err(failed(INSERT_TRANSACTION))?;
        Ok(())
    }
}
