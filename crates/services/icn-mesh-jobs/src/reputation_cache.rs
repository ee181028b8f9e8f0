use anyhow::Result;
use icn_types::{PeriodicTask, ReputationUpdate, WorkerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::metrics;
use crate::reputation_client::ReputationClient;

/// Cache entry for a reputation score
struct CacheEntry {
    score: f64,
    /// When this entry was last updated
    last_updated: Instant,
}

/// Caching reputation client that wraps another client.
///
/// Updates go straight through and drop the cached score for that worker.
pub struct CachingReputationClient {
    inner_client: Arc<dyn ReputationClient>,
    cache: RwLock<HashMap<WorkerId, CacheEntry>>,
    cache_ttl: Duration,
}

impl CachingReputationClient {
    pub fn new(inner_client: Arc<dyn ReputationClient>, cache_ttl: Duration) -> Self {
        Self {
            inner_client,
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Purge expired entries from the cache
    pub async fn purge_expired(&self) {
        let mut cache = self.cache.write().await;
        let now = Instant::now();
        cache.retain(|_, entry| now.duration_since(entry.last_updated) < self.cache_ttl);
        metrics::update_reputation_cache_size(cache.len());
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ReputationClient for CachingReputationClient {
    async fn get_score(&self, worker: &WorkerId) -> Result<f64> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(worker) {
                if entry.last_updated.elapsed() < self.cache_ttl {
                    tracing::debug!(worker_id = %worker, "Cache hit for reputation score");
                    metrics::record_reputation_cache_hit();
                    return Ok(entry.score);
                }
            }
        }

        metrics::record_reputation_query();
        let score = self.inner_client.get_score(worker).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            worker.clone(),
            CacheEntry {
                score,
                last_updated: Instant::now(),
            },
        );
        metrics::update_reputation_cache_size(cache.len());
        Ok(score)
    }

    async fn update_score(&self, update: &ReputationUpdate) -> Result<()> {
        self.inner_client.update_score(update).await?;
        self.cache.write().await.remove(&update.worker_id);
        Ok(())
    }
}

/// Periodically removes expired entries from the cache.
pub fn spawn_cache_cleanup_task(cache: Arc<CachingReputationClient>, every: Duration) -> PeriodicTask {
    PeriodicTask::spawn("reputation-cache-cleanup", every, move || {
        let cache = cache.clone();
        async move {
            cache.purge_expired().await;
            tracing::debug!("Purged expired reputation cache entries");
        }
    })
}
