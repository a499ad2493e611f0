use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qlistener_core::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// A subscription as kept by the [`InMemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRow {
    /// Subscription id
    pub id: i64,
    /// Subscriber phone number
    pub msisdn: String,
    /// Service code
    pub service_code: String,
    /// Campaign code
    pub campaign_code: String,
    /// Mobile operator code
    pub operator_code: i64,
    /// Country code
    pub country_code: i64,
    /// Lifecycle status
    pub status: String,
    /// Whether the subscription is active for the reference cache
    pub active: bool,
    /// Billing attempts
    pub attempts_count: i32,
    /// Time of the last billing attempt
    pub last_pay_attempt_at: Option<DateTime<Utc>>,
    /// Periodic billing flag
    pub periodic: bool,
    /// Price
    pub price: i32,
    /// Why the subscription left active billing
    pub outflow_reason: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// The values used to seed a subscription with [`InMemoryStore::insert_subscription`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    /// Subscriber phone number
    pub msisdn: String,
    /// Service code
    pub service_code: String,
    /// Campaign code
    pub campaign_code: String,
    /// Mobile operator code
    pub operator_code: i64,
    /// Country code
    pub country_code: i64,
    /// Initial lifecycle status
    pub status: String,
    /// Whether the subscription is active for the reference cache
    pub active: bool,
    /// Price
    pub price: i32,
}

impl Default for NewSubscription {
    fn default() -> Self {
        Self {
            msisdn: String::new(),
            service_code: String::new(),
            campaign_code: String::new(),
            operator_code: 0,
            country_code: 0,
            status: status::PENDING.to_string(),
            active: true,
            price: 0,
        }
    }
}

/// A retry, live or expired, as kept by the [`InMemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRow {
    /// Retry id
    pub id: i64,
    /// Transaction id
    pub tid: String,
    /// Subscription id
    pub subscription_id: i64,
    /// Campaign code
    pub campaign_code: String,
    /// Service code
    pub service_code: String,
    /// Subscriber phone number
    pub msisdn: String,
    /// Mobile operator code
    pub operator_code: i64,
    /// Country code
    pub country_code: i64,
    /// Days to keep the retry
    pub keep_days: i32,
    /// Hours between attempts
    pub delay_hours: i32,
    /// Price
    pub price: i32,
    /// Retry status
    pub status: String,
    /// Billing attempts
    pub attempts_count: i32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last billing attempt
    pub last_pay_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StoreData {
    subscriptions: BTreeMap<i64, SubscriptionRow>,
    retries: BTreeMap<i64, RetryRow>,
    retries_expired: Vec<RetryRow>,
    transactions: Vec<NewTransaction>,
    blacklist: Vec<String>,
    postpaid: Vec<String>,
    last_subscription_id: i64,
    last_retry_id: i64,
}

/// Errors returned by the [`InMemoryStore`].
#[derive(Debug, thiserror::Error)]
pub enum InMemoryStoreError {
    /// The store was switched off with [`InMemoryStore::set_unavailable`]
    #[error("store unavailable")]
    Unavailable,
}

/// An in-memory subscription store.
///
/// Clones share the same data. Each operation holds the lock for its whole duration, which gives
/// the same atomicity the postgres store gets from transactions.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    data: Arc<Mutex<StoreData>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryStore");
        Self::default()
    }

    /// Makes every following operation fail with [`InMemoryStoreError::Unavailable`], or
    /// restores it.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), InMemoryStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(InMemoryStoreError::Unavailable)
        } else {
            Ok(())
        }
    }

    /// Seeds a subscription and returns its id.
    pub async fn insert_subscription(&self, subscription: NewSubscription) -> i64 {
        let mut data = self.data.lock().await;
        data.last_subscription_id += 1;
        let id = data.last_subscription_id;
        data.subscriptions.insert(
            id,
            SubscriptionRow {
                id,
                msisdn: subscription.msisdn,
                service_code: subscription.service_code,
                campaign_code: subscription.campaign_code,
                operator_code: subscription.operator_code,
                country_code: subscription.country_code,
                status: subscription.status,
                active: subscription.active,
                attempts_count: 0,
                last_pay_attempt_at: None,
                periodic: false,
                price: subscription.price,
                outflow_reason: String::new(),
                created_at: Utc::now(),
            },
        );
        id
    }

    /// A subscription by id.
    pub async fn subscription(&self, id: i64) -> Option<SubscriptionRow> {
        self.data.lock().await.subscriptions.get(&id).cloned()
    }

    /// All subscriptions, by ascending id.
    pub async fn subscriptions(&self) -> Vec<SubscriptionRow> {
        self.data.lock().await.subscriptions.values().cloned().collect()
    }

    /// A live retry by id.
    pub async fn retry(&self, id: i64) -> Option<RetryRow> {
        self.data.lock().await.retries.get(&id).cloned()
    }

    /// All live retries, by ascending id.
    pub async fn retries(&self) -> Vec<RetryRow> {
        self.data.lock().await.retries.values().cloned().collect()
    }

    /// The expired retries archive, in insertion order.
    pub async fn retries_expired(&self) -> Vec<RetryRow> {
        self.data.lock().await.retries_expired.clone()
    }

    /// The transactions ledger, in insertion order.
    pub async fn transactions(&self) -> Vec<NewTransaction> {
        self.data.lock().await.transactions.clone()
    }

    /// The blacklisted numbers, in insertion order.
    pub async fn blacklist(&self) -> Vec<String> {
        self.data.lock().await.blacklist.clone()
    }

    /// The postpaid numbers, in insertion order.
    pub async fn postpaid(&self) -> Vec<String> {
        self.data.lock().await.postpaid.clone()
    }

    /// Active subscriptions keyed by msisdn and service, as loaded by the reference cache.
    pub async fn active_subscriptions(&self) -> Vec<(SubscriptionKey, i64)> {
        self.data
            .lock()
            .await
            .subscriptions
            .values()
            .filter(|s| s.active)
            .map(|s| (SubscriptionKey::new(&s.msisdn, &s.service_code), s.id))
            .collect()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    type Error = InMemoryStoreError;

    async fn insert_retry(&self, retry: &NewRetry) -> Result<i64, Self::Error> {
        self.check()?;
        let mut data = self.data.lock().await;
        data.last_retry_id += 1;
        let id = data.last_retry_id;
        data.retries.insert(
            id,
            RetryRow {
                id,
                tid: retry.tid.clone(),
                subscription_id: retry.subscription_id,
                campaign_code: retry.campaign_code.clone(),
                service_code: retry.service_code.clone(),
                msisdn: retry.msisdn.clone(),
                operator_code: retry.operator_code,
                country_code: retry.country_code,
                keep_days: retry.keep_days,
                delay_hours: retry.delay_hours,
                price: retry.price,
                status: String::new(),
                attempts_count: 0,
                created_at: Utc::now(),
                last_pay_attempt_at: None,
            },
        );
        Ok(id)
    }

    async fn touch_retry(
        &self,
        retry_id: i64,
        attempted_at: DateTime<Utc>,
    ) -> Result<u64, Self::Error> {
        self.check()?;
        let mut data = self.data.lock().await;
        match data.retries.get_mut(&retry_id) {
            Some(retry) => {
                retry.status = String::new();
                retry.attempts_count += 1;
                retry.last_pay_attempt_at = Some(attempted_at);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn remove_retry(&self, retry_id: i64, archive: bool) -> Result<u64, Self::Error> {
        self.check()?;
        let mut data = self.data.lock().await;
        match data.retries.remove(&retry_id) {
            Some(retry) => {
                if archive {
                    data.retries_expired.push(retry);
                }
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn write_subscription_status(
        &self,
        subscription_id: i64,
        status: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<u64, Self::Error> {
        self.check()?;
        let mut data = self.data.lock().await;
        match data.subscriptions.get_mut(&subscription_id) {
            Some(subscription) => {
                subscription.status = status.to_string();
                subscription.attempts_count += 1;
                subscription.last_pay_attempt_at = Some(attempted_at);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn write_subscription_periodic(
        &self,
        subscription_id: i64,
        periodic: bool,
    ) -> Result<u64, Self::Error> {
        self.check()?;
        let mut data = self.data.lock().await;
        match data.subscriptions.get_mut(&subscription_id) {
            Some(subscription) => {
                subscription.periodic = periodic;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn unsubscribe(
        &self,
        msisdn: &str,
        service_code: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<Option<AffectedSubscription>, Self::Error> {
        self.check()?;
        let mut data = self.data.lock().await;
        let latest = data.subscriptions.values_mut().rev().find(|s| {
            s.msisdn == msisdn && s.service_code == service_code && s.status != status::CANCELED
        });
        Ok(latest.map(|subscription| {
            subscription.status = status::CANCELED.to_string();
            subscription.attempts_count += 1;
            subscription.last_pay_attempt_at = Some(attempted_at);
            AffectedSubscription {
                id: subscription.id,
                campaign_code: subscription.campaign_code.clone(),
                operator_code: subscription.operator_code,
                attempts_count: subscription.attempts_count,
            }
        }))
    }

    async fn unsubscribe_all(
        &self,
        msisdn: &str,
        reason: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<Vec<AffectedSubscription>, Self::Error> {
        self.check()?;
        let mut data = self.data.lock().await;
        Ok(data
            .subscriptions
            .values_mut()
            .filter(|s| s.msisdn == msisdn && !status::is_terminal(&s.status))
            .map(|subscription| {
                subscription.status = status::PURGED.to_string();
                subscription.outflow_reason = reason.to_string();
                subscription.last_pay_attempt_at = Some(attempted_at);
                AffectedSubscription {
                    id: subscription.id,
                    campaign_code: subscription.campaign_code.clone(),
                    operator_code: subscription.operator_code,
                    attempts_count: subscription.attempts_count,
                }
            })
            .collect())
    }

    async fn add_blacklisted_number(&self, msisdn: &str) -> Result<(), Self::Error> {
        self.check()?;
        self.data.lock().await.blacklist.push(msisdn.to_string());
        Ok(())
    }

    async fn add_postpaid_number(&self, msisdn: &str) -> Result<(), Self::Error> {
        self.check()?;
        self.data.lock().await.postpaid.push(msisdn.to_string());
        Ok(())
    }

    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<(), Self::Error> {
        self.check()?;
        self.data.lock().await.transactions.push(transaction.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(msisdn: &str, service_code: &str, status: &str) -> NewSubscription {
        NewSubscription {
            msisdn: msisdn.to_string(),
            service_code: service_code.to_string(),
            campaign_code: "CMP1".to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unsubscribe_picks_the_latest_subscription() {
        let store = InMemoryStore::new();
        let first = store.insert_subscription(subscription("7999", "S", "")).await;
        let second = store.insert_subscription(subscription("7999", "S", "paid")).await;

        let affected = store
            .unsubscribe("7999", "S", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(affected.id, second);
        assert_eq!(store.subscription(first).await.unwrap().status, "");
        assert_eq!(store.subscription(second).await.unwrap().status, "canceled");
    }

    #[tokio::test]
    async fn unsubscribe_all_skips_terminal_subscriptions() {
        let store = InMemoryStore::new();
        let active = store.insert_subscription(subscription("7999", "S1", "")).await;
        let rejected = store
            .insert_subscription(subscription("7999", "S2", "rejected"))
            .await;
        let other = store.insert_subscription(subscription("7000", "S1", "")).await;

        let purged = store
            .unsubscribe_all("7999", "purge request", Utc::now())
            .await
            .unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].id, active);
        assert_eq!(store.subscription(rejected).await.unwrap().status, "rejected");
        assert_eq!(store.subscription(other).await.unwrap().status, "");
        assert_eq!(
            store.subscription(active).await.unwrap().outflow_reason,
            "purge request"
        );
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_write() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(store.add_postpaid_number("7999").await.is_err());
        store.set_unavailable(false);
        assert!(store.add_postpaid_number("7999").await.is_ok());
        assert_eq!(store.postpaid().await, vec!["7999".to_string()]);
    }
}
