//! Storage definitions for the subscription lifecycle.

use crate::record::Record;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The values written by `StartRetry`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRetry {
    /// Transaction id
    pub tid: String,
    /// Days the retry is kept before expiring
    pub keep_days: i32,
    /// Hours between billing attempts
    pub delay_hours: i32,
    /// Subscriber phone number
    pub msisdn: String,
    /// Mobile operator code
    pub operator_code: i64,
    /// Country code
    pub country_code: i64,
    /// Service code
    pub service_code: String,
    /// The subscription being billed
    pub subscription_id: i64,
    /// Campaign code
    pub campaign_code: String,
    /// Price to charge
    pub price: i32,
}

impl From<&Record> for NewRetry {
    fn from(r: &Record) -> Self {
        Self {
            tid: r.tid.clone(),
            keep_days: r.keep_days,
            delay_hours: r.delay_hours,
            msisdn: r.msisdn.clone(),
            operator_code: r.operator_code,
            country_code: r.country_code,
            service_code: r.service_code.clone(),
            subscription_id: r.subscription_id,
            campaign_code: r.campaign_code.clone(),
            price: r.price,
        }
    }
}

/// A row of the append-only transactions ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    /// Transaction id
    pub tid: String,
    /// When the charge was sent
    pub sent_at: DateTime<Utc>,
    /// Subscriber phone number
    pub msisdn: String,
    /// Billing result
    pub result: String,
    /// Mobile operator code
    pub operator_code: i64,
    /// Country code
    pub country_code: i64,
    /// Service code
    pub service_code: String,
    /// The subscription charged
    pub subscription_id: i64,
    /// Campaign code
    pub campaign_code: String,
    /// Token returned by the operator
    pub operator_token: String,
    /// Price charged
    pub price: i32,
}

impl From<&Record> for NewTransaction {
    fn from(r: &Record) -> Self {
        Self {
            tid: r.tid.clone(),
            sent_at: r.attempted_at(),
            msisdn: r.msisdn.clone(),
            result: r.result.clone(),
            operator_code: r.operator_code,
            country_code: r.country_code,
            service_code: r.service_code.clone(),
            subscription_id: r.subscription_id,
            campaign_code: r.campaign_code.clone(),
            operator_token: r.operator_token.clone(),
            price: r.price,
        }
    }
}

/// The data of a subscription moved out of active billing by an unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffectedSubscription {
    /// Subscription id
    pub id: i64,
    /// Campaign the subscription came from
    pub campaign_code: String,
    /// Mobile operator code
    pub operator_code: i64,
    /// Billing attempts recorded on the subscription
    pub attempts_count: i32,
}

/// `SubscriptionStore` is the persistence seam of the lifecycle handlers.
///
/// Every method is one atomic mutation from the caller's point of view. Implementations that need
/// more than one statement (archiving a retry, the select-then-update of unsubscribes) must run
/// them in a single transaction.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// The error returned when the store can't complete an operation
    type Error: std::error::Error + Send + Sync + 'static;

    /// Inserts a retry and returns its id.
    async fn insert_retry(&self, retry: &NewRetry) -> Result<i64, Self::Error>;

    /// Clears the status of a retry, bumps its attempts and sets the last attempt time.
    ///
    /// Returns the number of rows touched.
    async fn touch_retry(
        &self,
        retry_id: i64,
        attempted_at: DateTime<Utc>,
    ) -> Result<u64, Self::Error>;

    /// Deletes a retry, first copying it into the expired archive when `archive` is set.
    ///
    /// Returns the number of retries deleted.
    async fn remove_retry(&self, retry_id: i64, archive: bool) -> Result<u64, Self::Error>;

    /// Sets the status of a subscription and records a billing attempt.
    async fn write_subscription_status(
        &self,
        subscription_id: i64,
        status: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<u64, Self::Error>;

    /// Sets the periodic flag of a subscription.
    async fn write_subscription_periodic(
        &self,
        subscription_id: i64,
        periodic: bool,
    ) -> Result<u64, Self::Error>;

    /// Cancels the most recent non-canceled subscription of `msisdn` to `service_code`.
    async fn unsubscribe(
        &self,
        msisdn: &str,
        service_code: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<Option<AffectedSubscription>, Self::Error>;

    /// Purges every subscription of `msisdn` not in a terminal status.
    async fn unsubscribe_all(
        &self,
        msisdn: &str,
        reason: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<Vec<AffectedSubscription>, Self::Error>;

    /// Appends a msisdn to the blacklist.
    async fn add_blacklisted_number(&self, msisdn: &str) -> Result<(), Self::Error>;

    /// Appends a msisdn to the postpaid list.
    async fn add_postpaid_number(&self, msisdn: &str) -> Result<(), Self::Error>;

    /// Appends a row to the transactions ledger.
    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<(), Self::Error>;
}
