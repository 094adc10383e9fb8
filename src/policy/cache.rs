//! Read-through policy cache.
//!
//! Resolutions are cached per [`ResolutionKey`] in a sharded map so readers of
//! different keys never contend on one lock. The policy snapshot behind them
//! is refreshed from the [`PolicySource`] once it is older than the TTL or
//! after an invalidation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::model::RateLimitPolicy;
use super::resolver::{PolicyResolver, ResolutionKey};
use super::source::PolicySource;
use crate::error::Result;

struct Snapshot {
    resolver: Arc<PolicyResolver>,
    loaded_at: Instant,
    /// Cache generation when the fetch started; any later invalidation
    /// makes the snapshot stale.
    generation: u64,
}

#[derive(Clone)]
struct CachedResolution {
    policy: Option<Arc<RateLimitPolicy>>,
    cached_at: Instant,
}

impl CachedResolution {
    fn policy_id(&self) -> Option<&str> {
        self.policy.as_ref().map(|p| p.id.as_str())
    }
}

/// Short-TTL, invalidation-aware cache in front of a policy source.
pub struct PolicyCache {
    source: Arc<dyn PolicySource>,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
    entries: DashMap<ResolutionKey, CachedResolution>,
    /// Bumped on every invalidation; resolutions computed under an older
    /// generation are not kept.
    generation: AtomicU64,
}

impl PolicyCache {
    pub fn new(source: Arc<dyn PolicySource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            snapshot: RwLock::new(None),
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Resolve the policy for a request, serving from cache when fresh.
    ///
    /// `Ok(None)` means no policy applies.
    pub async fn resolve(&self, key: &ResolutionKey) -> Result<Option<Arc<RateLimitPolicy>>> {
        let cached = self
            .entries
            .get(key)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .map(|entry| entry.policy.clone());
        if let Some(policy) = cached {
            return Ok(policy);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let resolver = self.resolver().await?;
        let policy = resolver.resolve(key);

        if self.generation.load(Ordering::Acquire) == generation {
            self.entries.insert(
                key.clone(),
                CachedResolution {
                    policy: policy.clone(),
                    cached_at: Instant::now(),
                },
            );
            // An invalidation between the check and the insert may have
            // swept before the entry landed
            if self.generation.load(Ordering::Acquire) != generation {
                self.entries.remove(key);
            }
        }

        Ok(policy)
    }

    /// Drop everything derived from `policy_id`. The next lookup reloads
    /// policies from the source.
    pub fn invalidate(&self, policy_id: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);

        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.policy_id() != Some(policy_id));
        debug!(
            policy_id = %policy_id,
            evicted = before.saturating_sub(self.entries.len()),
            "Invalidated policy"
        );
    }

    /// Flush every cached resolution and the policy snapshot.
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.snapshot.write() = None;
        self.entries.clear();
        debug!("Invalidated all cached policies");
    }

    /// Remove resolutions older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.cached_at.elapsed() < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    /// Number of cached resolutions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Periodically purge expired resolutions. The task stops once the cache
    /// is dropped.
    pub fn spawn_expiry(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired policy resolutions");
                }
            }
        })
    }

    async fn resolver(&self) -> Result<Arc<PolicyResolver>> {
        let generation = self.generation.load(Ordering::Acquire);
        let stale = {
            let snapshot = self.snapshot.read();
            match snapshot.as_ref() {
                Some(s) if s.generation == generation && s.loaded_at.elapsed() < self.ttl => {
                    return Ok(s.resolver.clone());
                }
                Some(s) => Some(s.resolver.clone()),
                None => None,
            }
        };

        match self.source.fetch_policies().await {
            Ok(policies) => {
                let resolver = Arc::new(PolicyResolver::new(policies));
                info!(active = resolver.len(), "Loaded policy snapshot");
                *self.snapshot.write() = Some(Snapshot {
                    resolver: resolver.clone(),
                    loaded_at: Instant::now(),
                    generation,
                });
                Ok(resolver)
            }
            Err(e) => match stale {
                Some(resolver) => {
                    warn!(error = %e, "Policy source failed, serving stale snapshot");
                    Ok(resolver)
                }
                None => Err(e),
            },
        }
    }
}

impl std::fmt::Debug for PolicyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::policy::{AlgorithmKind, StaticPolicySource};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Counts fetches and can be switched into a failing mode.
    struct CountingSource {
        inner: StaticPolicySource,
        fetches: AtomicUsize,
        failing: std::sync::atomic::AtomicBool,
    }

    impl CountingSource {
        fn new(policies: Vec<RateLimitPolicy>) -> Self {
            Self {
                inner: StaticPolicySource::new(policies),
                fetches: AtomicUsize::new(0),
                failing: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PolicySource for CountingSource {
        async fn fetch_policies(&self) -> Result<Vec<RateLimitPolicy>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(EngineError::PolicySource("backend down".to_string()));
            }
            self.inner.fetch_policies().await
        }
    }

    fn policy(id: &str, limit: u64) -> RateLimitPolicy {
        RateLimitPolicy::new(id, AlgorithmKind::FixedWindow, limit, 1)
    }

    #[tokio::test]
    async fn test_repeated_lookups_hit_cache() {
        let source = Arc::new(CountingSource::new(vec![policy("global", 10)]));
        let cache = PolicyCache::new(source.clone(), Duration::from_secs(30));
        let key = ResolutionKey::new("acme", "/x");

        for _ in 0..10 {
            let resolved = cache.resolve(&key).await.unwrap().unwrap();
            assert_eq!(resolved.id, "global");
        }
        assert_eq!(source.fetches(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_picks_up_updates() {
        let source = Arc::new(CountingSource::new(vec![policy("global", 10)]));
        let cache = PolicyCache::new(source.clone(), Duration::from_secs(30));
        let key = ResolutionKey::new("acme", "/x");

        assert_eq!(cache.resolve(&key).await.unwrap().unwrap().limit_for_period, 10);

        source.inner.upsert(policy("global", 99));
        // Still cached until invalidated
        assert_eq!(cache.resolve(&key).await.unwrap().unwrap().limit_for_period, 10);

        cache.invalidate("global");
        assert_eq!(cache.resolve(&key).await.unwrap().unwrap().limit_for_period, 99);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_only_evicts_matching_entries() {
        let source = Arc::new(CountingSource::new(vec![
            policy("global", 10),
            policy("acme", 5).for_client("acme"),
        ]));
        let cache = PolicyCache::new(source, Duration::from_secs(30));

        cache.resolve(&ResolutionKey::new("acme", "/x")).await.unwrap();
        cache.resolve(&ResolutionKey::new("globex", "/x")).await.unwrap();
        assert_eq!(cache.len(), 2);

        cache.invalidate("acme");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let source = Arc::new(CountingSource::new(vec![policy("global", 10)]));
        let cache = PolicyCache::new(source.clone(), Duration::from_millis(20));
        let key = ResolutionKey::new("acme", "/x");

        cache.resolve(&key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired(), 1);

        cache.resolve(&key).await.unwrap();
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_no_policy_is_cached_as_none() {
        let source = Arc::new(CountingSource::new(vec![policy("acme", 5).for_client("acme")]));
        let cache = PolicyCache::new(source.clone(), Duration::from_secs(30));
        let key = ResolutionKey::new("globex", "/x");

        assert!(cache.resolve(&key).await.unwrap().is_none());
        assert!(cache.resolve(&key).await.unwrap().is_none());
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_source_failure_serves_stale_snapshot() {
        let source = Arc::new(CountingSource::new(vec![policy("global", 10)]));
        let cache = PolicyCache::new(source.clone(), Duration::from_secs(30));

        cache.resolve(&ResolutionKey::new("a", "/x")).await.unwrap();
        source.failing.store(true, Ordering::SeqCst);
        cache.invalidate("global");

        let resolved = cache.resolve(&ResolutionKey::new("b", "/x")).await.unwrap();
        assert_eq!(resolved.unwrap().id, "global");
    }

    #[tokio::test]
    async fn test_source_failure_without_snapshot_is_error() {
        let source = Arc::new(CountingSource::new(vec![]));
        source.failing.store(true, Ordering::SeqCst);
        let cache = PolicyCache::new(source, Duration::from_secs(30));

        let result = cache.resolve(&ResolutionKey::new("a", "/x")).await;
        assert!(matches!(result, Err(EngineError::PolicySource(_))));
    }

    /// Serves the current policies, but an update and its invalidation land
    /// while the first fetch is in flight.
    struct UpdatedDuringFetch {
        inner: StaticPolicySource,
        cache: std::sync::OnceLock<Weak<PolicyCache>>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl PolicySource for UpdatedDuringFetch {
        async fn fetch_policies(&self) -> Result<Vec<RateLimitPolicy>> {
            let policies = self.inner.fetch_policies().await?;
            if self.fetches.fetch_add(1, Ordering::SeqCst) == 0 {
                self.inner.upsert(policy("global", 99));
                if let Some(cache) = self.cache.get().and_then(Weak::upgrade) {
                    cache.invalidate("global");
                }
            }
            Ok(policies)
        }
    }

    #[tokio::test]
    async fn test_resolution_racing_invalidation_is_not_kept() {
        let source = Arc::new(UpdatedDuringFetch {
            inner: StaticPolicySource::new(vec![policy("global", 10)]),
            cache: std::sync::OnceLock::new(),
            fetches: AtomicUsize::new(0),
        });
        let cache = Arc::new(PolicyCache::new(source.clone(), Duration::from_secs(30)));
        assert!(source.cache.set(Arc::downgrade(&cache)).is_ok());
        let key = ResolutionKey::new("acme", "/x");

        // The in-flight answer predates the update and is not cached
        assert_eq!(cache.resolve(&key).await.unwrap().unwrap().limit_for_period, 10);
        assert!(cache.is_empty());

        // Nor is the snapshot it came from reused
        assert_eq!(cache.resolve(&key).await.unwrap().unwrap().limit_for_period, 99);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_outdated_entry_survives_concurrent_invalidation() {
        let source = Arc::new(CountingSource::new(vec![policy("global", 10)]));
        let cache = Arc::new(PolicyCache::new(source.clone(), Duration::from_secs(30)));

        let readers: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for n in 0..200 {
                        let key = ResolutionKey::new(format!("client-{}", (i + n) % 16), "/x");
                        cache.resolve(&key).await.unwrap();
                        if n % 20 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();

        tokio::task::yield_now().await;
        source.inner.upsert(policy("global", 99));
        cache.invalidate("global");

        for reader in readers {
            reader.await.unwrap();
        }
        for entry in cache.entries.iter() {
            let limit = entry.policy.as_ref().map(|p| p.limit_for_period);
            assert_eq!(limit, Some(99), "outdated entry for {:?}", entry.key());
        }
    }

    #[tokio::test]
    async fn test_expiry_task_stops_when_cache_dropped() {
        let source = Arc::new(CountingSource::new(vec![policy("global", 10)]));
        let cache = Arc::new(PolicyCache::new(source, Duration::from_millis(5)));
        cache.resolve(&ResolutionKey::new("a", "/x")).await.unwrap();

        let handle = cache.spawn_expiry(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty());

        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("expiry task should stop")
            .unwrap();
    }
}
