use crate::store::InMemoryStore;
use async_trait::async_trait;
use qlistener_core::cache::{CAMPAIGNS_TABLE, SUBSCRIPTIONS_TABLE};
use qlistener_core::prelude::*;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A campaigns cache source backed by a vector that tests can replace.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCampaignSource {
    campaigns: Arc<Mutex<Vec<CampaignEntry>>>,
}

impl InMemoryCampaignSource {
    /// Creates a source with the given active campaigns.
    pub fn new(campaigns: Vec<CampaignEntry>) -> Self {
        Self {
            campaigns: Arc::new(Mutex::new(campaigns)),
        }
    }

    /// Replaces the active campaigns. The cache sees them on its next reload.
    pub async fn replace(&self, campaigns: Vec<CampaignEntry>) {
        *self.campaigns.lock().await = campaigns;
    }
}

#[async_trait]
impl CacheSource for InMemoryCampaignSource {
    type Key = String;
    type Value = CampaignEntry;
    type Error = Infallible;

    fn table(&self) -> &str {
        CAMPAIGNS_TABLE
    }

    async fn load(&self) -> Result<Vec<(String, CampaignEntry)>, Infallible> {
        Ok(self
            .campaigns
            .lock()
            .await
            .iter()
            .map(|c| (c.hash.clone(), c.clone()))
            .collect())
    }
}

/// A subscriptions cache source reading the active subscriptions of an [`InMemoryStore`].
#[derive(Clone, Debug)]
pub struct InMemorySubscriptionSource {
    store: InMemoryStore,
}

impl InMemorySubscriptionSource {
    /// Creates a source over the given store.
    pub fn new(store: InMemoryStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CacheSource for InMemorySubscriptionSource {
    type Key = SubscriptionKey;
    type Value = i64;
    type Error = Infallible;

    fn table(&self) -> &str {
        SUBSCRIPTIONS_TABLE
    }

    async fn load(&self) -> Result<Vec<(SubscriptionKey, i64)>, Infallible> {
        Ok(self.store.active_subscriptions().await)
    }
}
