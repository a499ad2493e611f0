//! Read-optimized reference caches kept in sync with the database.
//!
//! A [`ReferenceCache`] exposes one immutable snapshot at a time. `reload()` reads the whole
//! backing table without holding the lock and then swaps the snapshot in, so lookups always see
//! either the old or the new complete mapping.

use async_trait::async_trait;
use log::{debug, error, info};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Name of the campaigns reference table.
pub const CAMPAIGNS_TABLE: &str = "campaigns";

/// Name of the subscriptions reference table.
pub const SUBSCRIPTIONS_TABLE: &str = "subscriptions";

/// An active campaign, looked up by its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignEntry {
    /// Campaign hash as used in landing page URLs
    pub hash: String,
    /// Campaign id
    pub id: i64,
    /// The service the campaign sells
    pub service_id: i64,
}

/// Key of the active subscriptions cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Subscriber phone number
    pub msisdn: String,
    /// Service code
    pub service_code: String,
}

impl SubscriptionKey {
    /// Creates a new key.
    pub fn new(msisdn: impl Into<String>, service_code: impl Into<String>) -> Self {
        Self {
            msisdn: msisdn.into(),
            service_code: service_code.into(),
        }
    }
}

/// Errors raised by reference caches.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No cache is registered for the table
    #[error("unknown table: {0}")]
    UnknownTable(String),
    /// Reading the backing table failed
    #[error("failed to load {table}: {source}")]
    Load {
        /// The table being loaded
        table: String,
        /// The underlying error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// The backing table of a [`ReferenceCache`].
#[async_trait]
pub trait CacheSource: Send + Sync {
    /// The lookup key
    type Key: Eq + Hash + Clone + Send + Sync;
    /// The cached value
    type Value: Clone + Send + Sync;
    /// The error returned by `load`
    type Error: std::error::Error + Send + Sync + 'static;

    /// The table name used to address this cache on reload requests.
    fn table(&self) -> &str;

    /// Reads every active row.
    async fn load(&self) -> Result<Vec<(Self::Key, Self::Value)>, Self::Error>;
}

/// A snapshot cache over a [`CacheSource`].
pub struct ReferenceCache<S>
where
    S: CacheSource,
{
    source: S,
    entries: RwLock<Arc<HashMap<S::Key, S::Value>>>,
}

impl<S> ReferenceCache<S>
where
    S: CacheSource,
{
    /// Creates an empty cache. Call [`reload`](Self::reload) to fill it.
    pub fn new(source: S) -> Self {
        Self {
            source,
            entries: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Looks up a key in the current snapshot.
    pub async fn get(&self, key: &S::Key) -> Option<S::Value> {
        self.entries.read().await.get(key).cloned()
    }

    /// The current snapshot. It never changes once returned.
    pub async fn snapshot(&self) -> Arc<HashMap<S::Key, S::Value>> {
        Arc::clone(&*self.entries.read().await)
    }

    /// Number of entries in the current snapshot.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the current snapshot is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Rebuilds the snapshot from the backing table and returns its size.
    ///
    /// On error the current snapshot is kept.
    pub async fn reload(&self) -> Result<usize, CacheError> {
        let table = self.source.table().to_string();
        debug!("Reloading '{}' cache...", table);
        let begin = Instant::now();

        let rows = self.source.load().await.map_err(|e| {
            error!("Failed to reload '{}' cache: {}", table, e);
            CacheError::Load {
                table: table.clone(),
                source: Box::new(e),
            }
        })?;
        let fresh: HashMap<S::Key, S::Value> = rows.into_iter().collect();
        let size = fresh.len();

        *self.entries.write().await = Arc::new(fresh);
        info!(
            "Reloaded '{}' cache: {} entries in {:?}",
            table,
            size,
            begin.elapsed()
        );
        Ok(size)
    }
}

/// Something that can be reloaded by table name.
#[async_trait]
pub trait Reload: Send + Sync {
    /// The table this cache mirrors.
    fn table(&self) -> &str;

    /// Rebuilds the cache.
    async fn reload(&self) -> Result<usize, CacheError>;
}

#[async_trait]
impl<S> Reload for ReferenceCache<S>
where
    S: CacheSource,
{
    fn table(&self) -> &str {
        self.source.table()
    }

    async fn reload(&self) -> Result<usize, CacheError> {
        ReferenceCache::reload(self).await
    }
}

/// Reference caches addressable by table name, the target of cache reload signals.
#[derive(Default, Clone)]
pub struct CacheRegistry {
    caches: HashMap<String, Arc<dyn Reload>>,
}

impl CacheRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cache under its table name, replacing any previous one.
    pub fn register(&mut self, cache: Arc<dyn Reload>) {
        self.caches.insert(cache.table().to_string(), cache);
    }

    /// The registered table names, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.caches.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Reloads the cache of one table.
    pub async fn reload(&self, table: &str) -> Result<usize, CacheError> {
        match self.caches.get(table) {
            Some(cache) => cache.reload().await,
            None => {
                error!("Cache reload requested for unknown table '{}'", table);
                Err(CacheError::UnknownTable(table.to_string()))
            }
        }
    }

    /// Reloads every registered cache, stopping at the first failure.
    pub async fn reload_all(&self) -> Result<(), CacheError> {
        for table in self.tables() {
            self.reload(&table).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("table unavailable")]
    struct Unavailable;

    struct VecSource {
        rows: Mutex<Option<Vec<(String, i64)>>>,
    }

    impl VecSource {
        fn new(rows: Vec<(&str, i64)>) -> Self {
            Self {
                rows: Mutex::new(Some(
                    rows.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                )),
            }
        }

        fn set(&self, rows: Option<Vec<(&str, i64)>>) {
            *self.rows.lock().unwrap() =
                rows.map(|rows| rows.into_iter().map(|(k, v)| (k.to_string(), v)).collect());
        }
    }

    #[async_trait]
    impl CacheSource for VecSource {
        type Key = String;
        type Value = i64;
        type Error = Unavailable;

        fn table(&self) -> &str {
            "things"
        }

        async fn load(&self) -> Result<Vec<(String, i64)>, Unavailable> {
            self.rows.lock().unwrap().clone().ok_or(Unavailable)
        }
    }

    const KEYS: usize = 100;

    /// Every load returns the same keys, all mapped to a new generation number.
    #[derive(Default)]
    struct GenerationSource {
        generation: AtomicI64,
    }

    #[async_trait]
    impl CacheSource for GenerationSource {
        type Key = String;
        type Value = i64;
        type Error = Unavailable;

        fn table(&self) -> &str {
            "generations"
        }

        async fn load(&self) -> Result<Vec<(String, i64)>, Unavailable> {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let mut rows = Vec::with_capacity(KEYS);
            for i in 0..KEYS {
                rows.push((format!("k{}", i), generation));
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Ok(rows)
        }
    }

    #[tokio::test]
    async fn cache_is_empty_until_reloaded() {
        let cache = ReferenceCache::new(VecSource::new(vec![("a", 1)]));
        assert!(cache.is_empty().await);
        assert_eq!(cache.reload().await.unwrap(), 1);
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
    }

    #[tokio::test]
    async fn reload_replaces_the_whole_mapping() {
        let cache = ReferenceCache::new(VecSource::new(vec![("a", 1), ("b", 2)]));
        cache.reload().await.unwrap();

        cache.source.set(Some(vec![("b", 20), ("c", 30)]));
        cache.reload().await.unwrap();

        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert_eq!(cache.get(&"b".to_string()).await, Some(20));
        assert_eq!(cache.get(&"c".to_string()).await, Some(30));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn failed_reload_keeps_the_previous_mapping() {
        let cache = ReferenceCache::new(VecSource::new(vec![("a", 1)]));
        cache.reload().await.unwrap();

        cache.source.set(None);
        let err = cache.reload().await.unwrap_err();
        assert!(matches!(err, CacheError::Load { ref table, .. } if table == "things"));
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
    }

    #[tokio::test]
    async fn snapshots_are_not_affected_by_later_reloads() {
        let cache = ReferenceCache::new(VecSource::new(vec![("a", 1), ("b", 2)]));
        cache.reload().await.unwrap();
        let before = cache.snapshot().await;

        cache.source.set(Some(vec![("a", 10), ("b", 20)]));
        cache.reload().await.unwrap();

        assert_eq!(before.get("a"), Some(&1));
        assert_eq!(before.get("b"), Some(&2));
        let after = cache.snapshot().await;
        assert_eq!(after.get("a"), Some(&10));
        assert_eq!(after.get("b"), Some(&20));
    }

    #[tokio::test]
    async fn registry_rejects_unknown_tables() {
        let cache = Arc::new(ReferenceCache::new(VecSource::new(vec![("a", 1)])));
        let mut registry = CacheRegistry::new();
        registry.register(cache.clone());

        assert!(matches!(
            registry.reload("campaigns").await,
            Err(CacheError::UnknownTable(t)) if t == "campaigns"
        ));
        assert!(cache.is_empty().await);

        assert_eq!(registry.reload("things").await.unwrap(), 1);
        assert_eq!(registry.tables(), vec!["things".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lookups_during_reloads_see_one_generation() {
        let cache = Arc::new(ReferenceCache::new(GenerationSource::default()));
        cache.reload().await.unwrap();

        let reloader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for _ in 0..50 {
                    cache.reload().await.unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    for _ in 0..200 {
                        let snapshot = cache.snapshot().await;
                        assert_eq!(snapshot.len(), KEYS);
                        let generation = snapshot["k0"];
                        assert!(
                            snapshot.values().all(|&v| v == generation),
                            "snapshot mixes generations"
                        );
                        assert!(cache.get(&"k99".to_string()).await.is_some());
                        seen.push(generation);
                        tokio::task::yield_now().await;
                    }
                    seen
                })
            })
            .collect();

        reloader.await.unwrap();
        for reader in readers {
            let seen = reader.await.unwrap();
            assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        }
        assert_eq!(cache.snapshot().await["k0"], 51);
    }
}
