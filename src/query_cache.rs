use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{error, warn};

use crate::cache_entry::CacheEntry;
use crate::cache_observer::{CacheEvent, CacheObserver, QueryCacheKey, QueryCachePayload};
use crate::error::QueryCacheError;
use crate::eviction::{EvictionCandidate, EvictionPolicy};
use crate::instant::Instant;
use crate::metrics::{CacheInfo, CacheMetrics};
use crate::query_options::QueryCacheOptions;

/// Type-erased view of a `CacheEntry<T>` (spec section 9's option (a):
/// "a trait/interface with `Any`-style downcasting keyed on the key's typed
/// tag"). `QueryCache` stores one of these per key-string regardless of `T`;
/// a downcast failure at `get`/`set` surfaces as `TypeMismatch` rather than
/// silently misreading another type's bytes.
trait ErasedEntry: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn created_at(&self) -> Instant;
    fn last_accessed_at(&self) -> Instant;
    fn access_count(&self) -> u64;
    fn reference_count(&self) -> u32;
    fn size_bytes(&self) -> usize;
    fn is_expired(&self) -> bool;
    fn set_reference_count(&mut self, count: u32);
    fn type_name(&self) -> &'static str;
}

impl<T: Send + Sync + 'static> ErasedEntry for CacheEntry<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn last_accessed_at(&self) -> Instant {
        self.last_accessed_at
    }

    fn access_count(&self) -> u64 {
        self.access_count
    }

    fn reference_count(&self) -> u32 {
        self.reference_count
    }

    fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    fn is_expired(&self) -> bool {
        CacheEntry::is_expired(self)
    }

    fn set_reference_count(&mut self, count: u32) {
        self.reference_count = count;
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A joined single-flight future, type-erased the same way as entries.
type SingleFlightSlot<T> = Shared<BoxFuture<'static, Result<Arc<T>, Arc<QueryCacheError>>>>;

/// The shared cache of query results (spec section 4.2).
///
/// All mutation goes through `entries`/`in_flight`, each guarded by its own
/// `std::sync::Mutex` — spec section 5's "a single reentrant guard per
/// QueryCache" in spirit; no `.await` is ever held across either lock.
/// Owned by exactly one [`crate::query_client::QueryClient`].
pub struct QueryCache {
    options: QueryCacheOptions,
    entries: Mutex<HashMap<String, Box<dyn ErasedEntry>>>,
    in_flight: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    eviction: Box<dyn EvictionPolicy>,
    metrics: CacheMetrics,
    cache_observers: Mutex<Vec<Arc<dyn CacheObserver>>>,
}

impl QueryCache {
    pub fn new(options: QueryCacheOptions) -> Self {
        let eviction = options.default_eviction_policy.policy();
        QueryCache {
            options,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            eviction,
            metrics: CacheMetrics::new(),
            cache_observers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a sink for raw create/update/remove events (spec section 6,
    /// consumed by the persistence plane). Order of registration is the order
    /// observers are notified in.
    pub fn register_cache_observer(&self, observer: Arc<dyn CacheObserver>) {
        self.cache_observers.lock().expect("cache poisoned").push(observer);
    }

    fn notify_cache_observers(&self, event: CacheEvent) {
        let observers: Vec<Arc<dyn CacheObserver>> = self.cache_observers.lock().expect("cache poisoned").clone();
        for observer in &observers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer.process_cache_event(event.clone())));
            if result.is_err() {
                error!(key = event.key(), "cache observer panicked while handling a cache event");
            }
        }
    }

    pub fn options(&self) -> &QueryCacheOptions {
        &self.options
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Records a hit or miss; bumps `last_accessed_at`/`access_count` on hit
    /// (spec section 4.2).
    pub fn get<T>(&self, key: &str) -> Result<Option<CacheEntry<T>>, QueryCacheError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get_mut(key) {
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
            Some(entry) => {
                let found = entry.type_name();
                let typed = entry.as_any_mut().downcast_mut::<CacheEntry<T>>().ok_or_else(|| {
                    QueryCacheError::TypeMismatch {
                        key: key.to_string(),
                        expected: std::any::type_name::<T>(),
                        found,
                    }
                })?;
                typed.touch();
                self.metrics.record_hit();
                Ok(Some(typed.clone()))
            }
        }
    }

    /// Reads an entry without touching `last_accessed_at`/`access_count` or
    /// recording a hit/miss. Used by staleness checks that must not disturb
    /// LRU/LFU ordering on their own.
    pub fn peek<T>(&self, key: &str) -> Option<CacheEntry<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entries = self.entries.lock().expect("cache poisoned");
        entries.get(key).and_then(|entry| entry.as_any().downcast_ref::<CacheEntry<T>>()).cloned()
    }

    /// Inserts or replaces an entry; triggers eviction if the cache now
    /// exceeds its configured bounds.
    pub fn set<T>(&self, key: &str, data: T, stale_time: Duration, cache_time: Duration, size_bytes: usize)
    where
        T: Send + Sync + 'static,
    {
        let entry = CacheEntry::new(data, stale_time, cache_time, size_bytes);
        {
            let mut entries = self.entries.lock().expect("cache poisoned");
            if let Some(old) = entries.get(key) {
                self.metrics.record_removal(old.size_bytes());
            }
            entries.insert(key.to_string(), Box::new(entry));
        }
        self.metrics.record_insert(size_bytes);
        // Exempt the entry this call just inserted from its own eviction pass:
        // otherwise a single unpinned insert against an already-at-bound cache
        // would immediately evict itself instead of temporarily overshooting
        // (spec section 8's eviction scenario relies on this).
        self.enforce_bounds(Some(key));
    }

    /// Like [`QueryCache::set`], but also notifies registered
    /// [`CacheObserver`]s with the value serialized to bytes (spec section
    /// 6's persistence bridge). Used by callers that already carry a
    /// `Serialize` bound on `T` — `set` itself stays unbounded so callers
    /// with no use for persistence never need to satisfy one.
    pub fn set_serialized<T>(&self, key: &str, data: T, stale_time: Duration, cache_time: Duration, size_bytes: usize)
    where
        T: Clone + Send + Sync + serde::Serialize + 'static,
    {
        let created = !self.contains(key);
        let bytes = serde_json::to_vec(&data).ok();
        self.set(key, data, stale_time, cache_time, size_bytes);
        let payload = QueryCachePayload {
            key: QueryCacheKey::new(key),
            bytes,
        };
        self.notify_cache_observers(if created { CacheEvent::Created(payload) } else { CacheEvent::Updated(payload) });
    }

    /// Drops the entry and any single-flight registration for `key`. Does
    /// not cancel an in-flight fetch already joined by other callers — they
    /// still observe its outcome (spec section 4.2).
    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        let removed = entries.remove(key);
        if let Some(entry) = &removed {
            self.metrics.record_removal(entry.size_bytes());
        }
        drop(entries);
        self.in_flight.lock().expect("cache poisoned").remove(key);
        if removed.is_some() {
            self.notify_cache_observers(CacheEvent::Removed(QueryCacheKey::new(key)));
        }
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache poisoned").clear();
        self.in_flight.lock().expect("cache poisoned").clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().expect("cache poisoned").contains_key(key)
    }

    /// Updates the pin count an eviction pass will see for `key` (spec
    /// section 4.2's `referenceCount == 0` eligibility rule). Called by
    /// [`crate::query::Query`] as subscribers attach/detach.
    pub fn set_reference_count(&self, key: &str, count: u32) {
        if let Some(entry) = self.entries.lock().expect("cache poisoned").get_mut(key) {
            entry.set_reference_count(count);
        }
    }

    /// Point-in-time metrics (spec section 4.2/6). `subscriptions` is summed
    /// here, across live entries, rather than tracked in `CacheMetrics`,
    /// since reference counts live on the entries themselves.
    pub fn info(&self) -> CacheInfo {
        let mut info = self.metrics.info();
        info.subscriptions = self
            .entries
            .lock()
            .expect("cache poisoned")
            .values()
            .map(|entry| entry.reference_count() as usize)
            .sum();
        info
    }

    /// Fetch throughput over the trailing `window` (spec section 2/4.4).
    pub fn throughput(&self, window: Duration) -> crate::metrics::ThroughputSnapshot {
        self.metrics.throughput(window)
    }

    /// Single-flight fetch coordination (spec section 4.2). If a fetch for
    /// `key` is already in flight, joins it; otherwise runs `fetch` and
    /// registers it for anyone else who calls in before it completes.
    /// Deregisters on completion either way.
    pub async fn deduplicate<T, F, Fut>(&self, key: &str, fetch: F) -> Result<Arc<T>, Arc<QueryCacheError>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueryCacheError>> + Send + 'static,
    {
        let existing = {
            let in_flight = self.in_flight.lock().expect("cache poisoned");
            in_flight.get(key).map(|slot| {
                slot.downcast_ref::<SingleFlightSlot<T>>()
                    .expect("single-flight slot registered under a mismatched type")
                    .clone()
            })
        };

        if let Some(shared) = existing {
            return shared.await;
        }

        let fut = fetch();
        let boxed: BoxFuture<'static, Result<Arc<T>, Arc<QueryCacheError>>> =
            async move { fut.await.map(Arc::new).map_err(Arc::new) }.boxed();
        let shared: SingleFlightSlot<T> = boxed.shared();

        {
            let mut in_flight = self.in_flight.lock().expect("cache poisoned");
            in_flight.insert(key.to_string(), Box::new(shared.clone()));
        }

        let result = shared.await;
        self.in_flight.lock().expect("cache poisoned").remove(key);
        result
    }

    /// Periodic garbage-collection sweep: removes entries past their
    /// `expiresAt` with `referenceCount == 0` (spec section 4.2).
    pub fn sweep_expired(&self) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.reference_count() == 0 && entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(entry) = entries.remove(&key) {
                self.metrics.record_removal(entry.size_bytes());
            }
        }
    }

    fn enforce_bounds(&self, protect: Option<&str>) {
        loop {
            let mut entries = self.entries.lock().expect("cache poisoned");
            let total_bytes: usize = entries.values().map(|entry| entry.size_bytes()).sum();
            let count = entries.len();
            let over_bytes = self.options.max_cache_size_bytes.is_some_and(|max| total_bytes > max);
            let over_count = self.options.max_entries.is_some_and(|max| count > max);
            if !over_bytes && !over_count {
                return;
            }

            let victim = {
                let candidates: Vec<EvictionCandidate> = entries
                    .iter()
                    .filter(|(key, entry)| entry.reference_count() == 0 && protect != Some(key.as_str()))
                    .map(|(key, entry)| EvictionCandidate {
                        key: key.as_str(),
                        created_at: entry.created_at(),
                        last_accessed_at: entry.last_accessed_at(),
                        access_count: entry.access_count(),
                        reference_count: entry.reference_count(),
                    })
                    .collect();
                self.eviction.select_victims(&candidates).first().map(|key| key.to_string())
            };

            match victim {
                Some(key) => {
                    if let Some(entry) = entries.remove(&key) {
                        self.metrics.record_eviction(entry.size_bytes());
                    }
                }
                None => {
                    // Spec section 9, open question (c): every entry is
                    // pinned, so the cache temporarily exceeds its bound.
                    warn!("cache exceeds configured bounds with no evictable entries; accepting overshoot");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_with_bounds(max_entries: Option<usize>, max_bytes: Option<usize>) -> QueryCache {
        QueryCache::new(QueryCacheOptions {
            max_entries,
            max_cache_size_bytes: max_bytes,
            ..Default::default()
        })
    }

    #[test]
    fn get_on_empty_cache_is_a_miss() {
        let cache = QueryCache::new(QueryCacheOptions::default());
        assert!(cache.get::<u32>("k").unwrap().is_none());
        assert_eq!(cache.info().misses, 1);
    }

    #[test]
    fn set_then_get_is_a_hit() {
        let cache = QueryCache::new(QueryCacheOptions::default());
        cache.set("k", 7u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        let entry = cache.get::<u32>("k").unwrap().unwrap();
        assert_eq!(entry.data, 7);
        assert_eq!(cache.info().hits, 1);
    }

    #[test]
    fn type_mismatch_is_an_error_not_a_silent_misread() {
        let cache = QueryCache::new(QueryCacheOptions::default());
        cache.set("k", 7u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        let err = cache.get::<String>("k").unwrap_err();
        assert!(matches!(err, QueryCacheError::TypeMismatch { .. }));
    }

    #[test]
    fn remove_drops_entry() {
        let cache = QueryCache::new(QueryCacheOptions::default());
        cache.set("k", 1u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        cache.remove("k");
        assert!(!cache.contains("k"));
    }

    #[test]
    fn info_reports_subscriptions_summed_across_entries() {
        let cache = QueryCache::new(QueryCacheOptions::default());
        cache.set("a", 1u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        cache.set("b", 2u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        assert_eq!(cache.info().subscriptions, 0);

        cache.set_reference_count("a", 2);
        cache.set_reference_count("b", 1);
        assert_eq!(cache.info().subscriptions, 3);
    }

    struct RecordingCacheObserver {
        events: Mutex<Vec<CacheEvent>>,
    }

    impl CacheObserver for RecordingCacheObserver {
        fn process_cache_event(&self, event: CacheEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn set_serialized_notifies_observers_with_created_then_updated() {
        let cache = QueryCache::new(QueryCacheOptions::default());
        let observer = Arc::new(RecordingCacheObserver { events: Mutex::new(Vec::new()) });
        cache.register_cache_observer(observer.clone());

        cache.set_serialized("k", 1u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        cache.set_serialized("k", 2u32, Duration::from_secs(10), Duration::from_secs(60), 4);

        let events = observer.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], CacheEvent::Created(_)));
        assert!(matches!(events[1], CacheEvent::Updated(_)));
        match &events[1] {
            CacheEvent::Updated(payload) => assert_eq!(payload.bytes.as_deref(), Some(b"2".as_slice())),
            _ => unreachable!(),
        }
    }

    #[test]
    fn remove_notifies_observers_only_when_an_entry_existed() {
        let cache = QueryCache::new(QueryCacheOptions::default());
        let observer = Arc::new(RecordingCacheObserver { events: Mutex::new(Vec::new()) });
        cache.register_cache_observer(observer.clone());

        cache.remove("missing");
        assert!(observer.events.lock().unwrap().is_empty());

        cache.set_serialized("k", 1u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        cache.remove("k");
        let events = observer.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], CacheEvent::Removed(_)));
    }

    #[test]
    fn pinned_entries_are_never_evicted_while_unpinned_candidates_exist() {
        let cache = cache_with_bounds(Some(2), None);
        cache.set("a", 1u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        cache.set_reference_count("a", 1);
        cache.set("b", 2u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        cache.set_reference_count("b", 1);
        cache.set("c", 3u32, Duration::from_secs(10), Duration::from_secs(60), 4);

        // Now over bound (3 > 2) with a, b pinned; next insert should evict c.
        cache.set("d", 4u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        assert!(cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("d"));
        assert!(!cache.contains("c"), "unpinned entry should have been evicted");
    }

    #[test]
    fn overshoot_is_accepted_when_all_entries_are_pinned() {
        let cache = cache_with_bounds(Some(1), None);
        cache.set("a", 1u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        cache.set_reference_count("a", 1);
        cache.set("b", 2u32, Duration::from_secs(10), Duration::from_secs(60), 4);
        cache.set_reference_count("b", 1);
        assert!(cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[test]
    fn sweep_expired_removes_only_expired_unpinned_entries() {
        let cache = QueryCache::new(QueryCacheOptions::default());
        cache.set("expired", 1u32, Duration::ZERO, Duration::ZERO, 4);
        cache.set("fresh", 2u32, Duration::from_secs(60), Duration::from_secs(120), 4);
        cache.sweep_expired();
        assert!(!cache.contains("expired"));
        assert!(cache.contains("fresh"));
    }

    #[tokio::test]
    async fn deduplicate_runs_fetch_exactly_once_for_concurrent_joiners() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .deduplicate("u", || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok::<_, QueryCacheError>("U".to_string())
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(*result, "U");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deduplicate_propagates_failure_to_all_joiners() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        let a = cache.clone();
        let b = cache.clone();

        let (ra, rb) = tokio::join!(
            a.deduplicate("k", || async {
                Err::<u32, _>(QueryCacheError::FetchFailed {
                    key: "k".into(),
                    source: Box::new(std::io::Error::other("boom")),
                })
            }),
            b.deduplicate("k", || async { Ok(0u32) })
        );
        assert!(ra.is_err());
        assert!(rb.is_err());
    }
}
