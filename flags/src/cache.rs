use std::sync::Arc;

use metrics::counter;

use crate::flag_definitions::Flag;
use crate::redis::{Client, CustomRedisError};

// Keep the prefix and channel byte-identical to what existing deployments
// publish, or mixed fleets stop invalidating each other.
pub const FLAG_CACHE_PREFIX: &str = "feature:";
pub const FLAG_UPDATES_CHANNEL: &str = "flag_updates";

/// Read-through cache of flag snapshots, shared between all service
/// instances through redis. Entries are whole snapshots keyed by flag key
/// and are always replaced wholesale, never mutated in place.
///
/// Constructed once at process start and cloned into handlers; cache and
/// bus failures degrade freshness but are never allowed to fail the request
/// that triggered them.
#[derive(Clone)]
pub struct FlagCache {
    client: Arc<dyn Client + Send + Sync>,
    ttl_seconds: u64,
}

impl FlagCache {
    pub fn new(client: Arc<dyn Client + Send + Sync>, ttl_seconds: u64) -> FlagCache {
        FlagCache {
            client,
            ttl_seconds,
        }
    }

    fn cache_key(key: &str) -> String {
        format!("{FLAG_CACHE_PREFIX}{}", key)
    }

    /// Returns the cached snapshot, or `None` on a miss. Transient redis
    /// errors and undecodable payloads are treated as misses so the caller
    /// falls back to the store.
    pub async fn get(&self, key: &str) -> Option<Flag> {
        let serialized = match self.client.get(Self::cache_key(key)).await {
            Ok(serialized) => serialized,
            Err(CustomRedisError::NotFound) => {
                counter!("flag_cache_misses_total").increment(1);
                return None;
            }
            Err(e) => {
                counter!("flag_cache_misses_total").increment(1);
                tracing::warn!("failed to read flag {} from cache: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str::<Flag>(&serialized) {
            Ok(flag) => {
                counter!("flag_cache_hits_total").increment(1);
                Some(flag)
            }
            Err(e) => {
                // A corrupt entry poisons every read until replaced; drop it.
                tracing::error!("failed to parse cached flag {}: {}", key, e);
                self.invalidate(key).await;
                None
            }
        }
    }

    /// Stores a snapshot, best-effort. The TTL bounds staleness if the entry
    /// is never invalidated.
    pub async fn put(&self, flag: &Flag) {
        let serialized = match serde_json::to_string(flag) {
            Ok(serialized) => serialized,
            Err(e) => {
                tracing::error!("failed to serialize flag {} for cache: {}", flag.key, e);
                return;
            }
        };

        if let Err(e) = self
            .client
            .set(Self::cache_key(&flag.key), serialized, Some(self.ttl_seconds))
            .await
        {
            tracing::warn!("failed to cache flag {}: {}", flag.key, e);
        }
    }

    /// Drops the cached snapshot so the next read reloads from the store.
    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.client.del(Self::cache_key(key)).await {
            tracing::warn!("failed to invalidate cached flag {}: {}", key, e);
        }
    }

    /// Announces a mutation to other instances. The message is the bare flag
    /// key, not the payload: subscribers reload from the store, so the event
    /// can never skew from store truth. Delivery is best-effort; a lost event
    /// only degrades freshness until the TTL ceiling.
    pub async fn publish_update(&self, key: &str) {
        if let Err(e) = self
            .client
            .publish(FLAG_UPDATES_CHANNEL.to_string(), key.to_string())
            .await
        {
            counter!("invalidation_publish_failures_total").increment(1);
            tracing::warn!("failed to publish invalidation for flag {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag_definitions::Flag;
    use crate::redis::MockRedisClient;

    fn test_flag(key: &str, version: i32) -> Flag {
        Flag {
            key: key.to_string(),
            description: None,
            enabled: true,
            rollout_percentage: 50,
            target_groups: vec![],
            version,
        }
    }

    fn setup() -> (FlagCache, MockRedisClient) {
        let redis = MockRedisClient::new();
        let cache = FlagCache::new(Arc::new(redis.clone()), 60);
        (cache, redis)
    }

    #[tokio::test]
    async fn test_put_then_get_returns_snapshot() {
        let (cache, _redis) = setup();
        let flag = test_flag("new-ui", 1);

        cache.put(&flag).await;
        assert_eq!(cache.get("new-ui").await, Some(flag));
    }

    #[tokio::test]
    async fn test_get_missing_key_is_a_miss() {
        let (cache, _redis) = setup();
        assert_eq!(cache.get("absent").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_drops_entry() {
        let (cache, redis) = setup();
        let flag = test_flag("new-ui", 1);

        cache.put(&flag).await;
        cache.invalidate("new-ui").await;

        assert!(!redis.contains("feature:new-ui"));
        assert_eq!(cache.get("new-ui").await, None);
    }

    #[tokio::test]
    async fn test_entries_are_namespaced() {
        let (cache, redis) = setup();
        cache.put(&test_flag("new-ui", 1)).await;
        assert!(redis.contains("feature:new-ui"));
    }

    #[tokio::test]
    async fn test_publish_update_sends_bare_key() {
        let (cache, redis) = setup();
        cache.publish_update("new-ui").await;

        assert_eq!(
            redis.published(),
            vec![("flag_updates".to_string(), "new-ui".to_string())]
        );
    }

    #[tokio::test]
    async fn test_corrupted_entry_is_dropped_and_misses() {
        let (cache, redis) = setup();
        redis.insert_raw("feature:new-ui".to_string(), "{not json".to_string());

        assert_eq!(cache.get("new-ui").await, None);
        assert!(!redis.contains("feature:new-ui"));
    }

    #[tokio::test]
    async fn test_broken_connection_is_a_miss_not_an_error() {
        let (cache, redis) = setup();
        redis.set_broken(true);
        assert_eq!(cache.get("new-ui").await, None);
    }
}
