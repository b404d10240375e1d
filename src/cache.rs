//! Short-lived memoization of decisions keyed by request fingerprint.
//!
//! Entries expire by TTL and the whole cache is cleared on policy reload:
//! a decision computed under a superseded policy set must never be served.
//! The clear alone cannot guarantee that, since an evaluation in flight
//! across a reload inserts after the clear; every entry therefore carries
//! the generation of the snapshot it was computed under, and a lookup
//! under any other generation treats the entry as absent and drops it.
//! Concurrent misses on the same key may both evaluate; inserts are
//! last-writer-wins, which is safe because both writers evaluated against
//! the same immutable snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::metrics::EngineMetricsHelper;
use crate::model::{AccessRequest, Decision, Effect};

#[derive(Debug, Clone)]
pub struct DecisionCacheConfig {
    /// TTL for permit decisions.
    pub permit_ttl: Duration,
    /// TTL for deny decisions, usually shorter so revoked access is not
    /// remembered for long.
    pub deny_ttl: Duration,
    pub max_entries: usize,
    pub enabled: bool,
}

impl Default for DecisionCacheConfig {
    fn default() -> Self {
        Self {
            permit_ttl: Duration::from_secs(300),
            deny_ttl: Duration::from_secs(60),
            max_entries: 10_000,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    decision: Decision,
    expires_at: Instant,
    created_at: Instant,
    generation: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DecisionCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
}

/// Thread-safe TTL decision cache.
pub struct DecisionCache {
    cache: DashMap<String, CacheEntry>,
    config: DecisionCacheConfig,
    stats: Arc<RwLock<DecisionCacheStats>>,
}

impl DecisionCache {
    #[must_use]
    pub fn new(config: DecisionCacheConfig) -> Self {
        Self {
            cache: DashMap::new(),
            config,
            stats: Arc::new(RwLock::new(DecisionCacheStats::default())),
        }
    }

    /// Look up a decision for the given request, valid only if it was
    /// computed under the given policy-set generation.
    pub async fn get(&self, request: &AccessRequest, generation: u64) -> Option<Decision> {
        if !self.config.enabled {
            return None;
        }

        let key = request.fingerprint();

        if let Some(entry) = self.cache.get(&key) {
            let usable = entry.generation == generation && Instant::now() < entry.expires_at;
            if usable {
                let decision = entry.decision.clone();
                drop(entry);

                let mut stats = self.stats.write().await;
                stats.hits += 1;
                EngineMetricsHelper::record_cache_operation("get", "hit");

                debug!(cache_key = %key, "decision cache hit");
                return Some(decision);
            }

            // Expired, or computed under a superseded policy set.
            drop(entry);
            self.cache.remove(&key);
            let mut stats = self.stats.write().await;
            stats.evictions += 1;
        }

        let mut stats = self.stats.write().await;
        stats.misses += 1;
        EngineMetricsHelper::record_cache_operation("get", "miss");
        None
    }

    /// Store a decision tagged with the generation of the snapshot it was
    /// evaluated against.
    pub async fn put(&self, request: &AccessRequest, decision: Decision, generation: u64) {
        if !self.config.enabled {
            return;
        }

        if self.cache.len() >= self.config.max_entries {
            self.evict_oldest().await;
        }

        let ttl = match decision.effect {
            Effect::Permit => self.config.permit_ttl,
            Effect::Deny => self.config.deny_ttl,
        };

        let now = Instant::now();
        let key = request.fingerprint();
        self.cache.insert(
            key.clone(),
            CacheEntry {
                decision,
                expires_at: now + ttl,
                created_at: now,
                generation,
            },
        );
        EngineMetricsHelper::record_cache_operation("put", "ok");

        let mut stats = self.stats.write().await;
        stats.entries = self.cache.len();

        debug!(cache_key = %key, ttl_seconds = ttl.as_secs(), "decision cached");
    }

    /// Drop every entry. Invoked on policy reload and via the invalidate
    /// endpoint; returns the number of entries removed.
    pub async fn clear(&self) -> usize {
        let cleared = self.cache.len();
        self.cache.clear();

        let mut stats = self.stats.write().await;
        stats.entries = 0;
        stats.evictions += cleared as u64;
        EngineMetricsHelper::record_cache_operation("clear", "ok");

        info!(cleared, "decision cache cleared");
        cleared
    }

    /// Remove expired entries. Called from the background sweep.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        let mut removed = 0u64;
        self.cache.retain(|_key, entry| {
            if now >= entry.expires_at {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            let mut stats = self.stats.write().await;
            stats.entries = self.cache.len();
            stats.evictions += removed;
            debug!(removed, remaining = self.cache.len(), "swept expired decisions");
        }
    }

    async fn evict_oldest(&self) {
        let target = std::cmp::max(1, self.config.max_entries / 10);
        let mut candidates: Vec<(String, Instant)> = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().created_at))
            .collect();
        candidates.sort_by_key(|(_, created_at)| *created_at);

        let mut removed = 0u64;
        for (key, _) in candidates.into_iter().take(target) {
            if self.cache.remove(&key).is_some() {
                removed += 1;
            }
        }

        let mut stats = self.stats.write().await;
        stats.evictions += removed;
        stats.entries = self.cache.len();
        debug!(removed, remaining = self.cache.len(), "evicted oldest decisions");
    }

    pub async fn stats(&self) -> DecisionCacheStats {
        let mut stats = self.stats.read().await.clone();
        stats.entries = self.cache.len();
        stats
    }
}

/// Periodic sweep of expired entries so idle keys do not pin memory until
/// their next lookup.
pub async fn run_cache_sweeper(cache: Arc<DecisionCache>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        cache.sweep_expired().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeMap, Decision};
    use tokio::time::sleep;

    fn request(action: &str) -> AccessRequest {
        let mut subject = AttributeMap::new();
        subject.insert("role".into(), "plan_viewer".into());
        AccessRequest {
            subject,
            resource_type: "plans".into(),
            action: action.into(),
            context: AttributeMap::new(),
        }
    }

    fn permit(policy: &str) -> Decision {
        Decision {
            effect: Effect::Permit,
            matched_policy: Some(policy.into()),
            evaluated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn basic_hit_miss_and_expiry() {
        let cache = DecisionCache::new(DecisionCacheConfig {
            permit_ttl: Duration::from_millis(80),
            deny_ttl: Duration::from_millis(80),
            ..Default::default()
        });
        let req = request("read");

        assert!(cache.get(&req, 1).await.is_none());

        cache.put(&req, permit("plan_read_policy"), 1).await;
        let hit = cache.get(&req, 1).await.unwrap();
        assert_eq!(hit.matched_policy.as_deref(), Some("plan_read_policy"));

        sleep(Duration::from_millis(120)).await;
        assert!(cache.get(&req, 1).await.is_none());
    }

    #[tokio::test]
    async fn deny_decisions_use_the_shorter_ttl() {
        let cache = DecisionCache::new(DecisionCacheConfig {
            permit_ttl: Duration::from_secs(60),
            deny_ttl: Duration::from_millis(50),
            ..Default::default()
        });
        let req = request("create");
        cache.put(&req, Decision::default_deny(), 1).await;
        assert!(cache.get(&req, 1).await.is_some());

        sleep(Duration::from_millis(90)).await;
        assert!(cache.get(&req, 1).await.is_none());
    }

    #[tokio::test]
    async fn entries_from_a_superseded_generation_are_not_served() {
        let cache = DecisionCache::new(DecisionCacheConfig::default());
        let req = request("read");

        cache.put(&req, permit("plan_read_policy"), 1).await;
        assert!(cache.get(&req, 1).await.is_some());

        // Same unexpired entry, newer policy-set generation: dropped.
        assert!(cache.get(&req, 2).await.is_none());
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let cache = DecisionCache::new(DecisionCacheConfig::default());
        cache.put(&request("read"), permit("p"), 1).await;
        cache.put(&request("create"), permit("p"), 1).await;

        let cleared = cache.clear().await;
        assert_eq!(cleared, 2);
        assert!(cache.get(&request("read"), 1).await.is_none());
    }

    #[tokio::test]
    async fn bounded_size_evicts_oldest() {
        let cache = DecisionCache::new(DecisionCacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        for action in ["a", "b", "c"] {
            cache.put(&request(action), permit("p"), 1).await;
        }
        let stats = cache.stats().await;
        assert!(stats.entries <= 2);
        assert!(stats.evictions > 0);
    }

    #[tokio::test]
    async fn disabled_cache_never_stores() {
        let cache = DecisionCache::new(DecisionCacheConfig {
            enabled: false,
            ..Default::default()
        });
        let req = request("read");
        cache.put(&req, permit("p"), 1).await;
        assert!(cache.get(&req, 1).await.is_none());
    }

    #[tokio::test]
    async fn stats_track_hits_and_misses() {
        let cache = DecisionCache::new(DecisionCacheConfig::default());
        let req = request("read");

        cache.get(&req, 1).await;
        cache.get(&req, 1).await;
        cache.put(&req, permit("p"), 1).await;
        cache.get(&req, 1).await;

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }
}
