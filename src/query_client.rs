use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::error;

use crate::cancellation::CancellationToken;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::dependency_manager::DependencyManager;
use crate::error::QueryCacheError;
use crate::gc::GarbageCollector;
use crate::instant::Instant;
use crate::metrics_exporter::{PerformanceSnapshot, QueryMetricsSnapshot};
use crate::observer::{Observer, QuerySnapshot};
use crate::query::{FetchFn, Query, QueryEventSink, QueryInit};
use crate::query_cache::QueryCache;
use crate::query_options::{QueryCacheOptions, QueryOptions};

/// Type-erased view of an `Arc<Query<T>>` (spec section 9's option (a),
/// applied to the query registry the same way `ErasedEntry` applies it to
/// `QueryCache`). Every operation a client needs to perform across queries
/// of unrelated `T` — invalidate, dispose, read metrics — is forwarded
/// through here so bulk operations (`invalidate_with_prefix`,
/// `invalidate_where`, `dispose`) don't need a type parameter at all.
trait ErasedQuery: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn key(&self) -> &str;
    fn dispose(&self);
    fn invalidate(&self);
    fn current_token(&self) -> Option<CancellationToken>;
    fn reference_count(&self) -> u32;
    fn metrics_snapshot(&self) -> QueryMetricsSnapshot;
    fn type_name(&self) -> &'static str;
}

impl<T> ErasedQuery for Arc<Query<T>>
where
    T: Clone + Send + Sync + serde::Serialize + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn key(&self) -> &str {
        self.as_ref().key()
    }

    fn dispose(&self) {
        self.as_ref().dispose()
    }

    fn invalidate(&self) {
        Query::invalidate(self)
    }

    fn current_token(&self) -> Option<CancellationToken> {
        self.as_ref().current_token()
    }

    fn reference_count(&self) -> u32 {
        self.as_ref().reference_count()
    }

    fn metrics_snapshot(&self) -> QueryMetricsSnapshot {
        self.as_ref().metrics_snapshot()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

enum EventKind {
    Loading,
    Success,
    Error,
    Settled,
}

/// Forwards a single query's lifecycle events back to its owning client
/// without the query holding a strong reference to it — `Query<T>` would
/// otherwise keep the client alive forever through the registry that in turn
/// keeps the query alive (spec section 9's ownership note: queries are
/// owned, clients are borrowed).
struct ClientEventSink(Weak<QueryClient>);

impl QueryEventSink for ClientEventSink {
    fn dispatch_loading(&self, snapshot: QuerySnapshot) {
        if let Some(client) = self.0.upgrade() {
            client.notify(EventKind::Loading, &snapshot, None);
        }
    }

    fn dispatch_success(&self, snapshot: QuerySnapshot) {
        if let Some(client) = self.0.upgrade() {
            client.notify(EventKind::Success, &snapshot, None);
        }
    }

    fn dispatch_error(&self, snapshot: QuerySnapshot, error: Arc<QueryCacheError>) {
        if let Some(client) = self.0.upgrade() {
            client.notify(EventKind::Error, &snapshot, Some(&error));
        }
    }

    fn dispatch_settled(&self, snapshot: QuerySnapshot) {
        if let Some(client) = self.0.upgrade() {
            client.notify(EventKind::Settled, &snapshot, None);
        }
    }
}

/// The top-level registry of queries, the shared cache, the circuit-breaker
/// registry, and the dependency manager (spec section 4.4). Analogous to the
/// teacher's `QueryClient`, generalized from a single-threaded,
/// `leptos`-scoped `Owner` to a plain `Arc`-shared handle any async runtime
/// task can hold.
pub struct QueryClient {
    cache: Arc<QueryCache>,
    queries: Mutex<HashMap<String, Box<dyn ErasedQuery>>>,
    breakers: CircuitBreakerRegistry,
    dependencies: Arc<DependencyManager>,
    observers: Mutex<Vec<Arc<dyn Observer>>>,
    error_reporters: Mutex<Vec<Arc<dyn Fn(&QueryCacheError) + Send + Sync>>>,
    gc: Mutex<Option<GarbageCollector>>,
    dispose_delay: Duration,
}

impl QueryClient {
    /// Creates a client and immediately starts its background GC sweep
    /// (spec section 4.2).
    pub fn new(options: QueryCacheOptions) -> Arc<Self> {
        let dispose_delay = options.default_dispose_delay;
        let gc_interval = options.gc_sweep_interval;
        let cache = Arc::new(QueryCache::new(options));

        let client = Arc::new(QueryClient {
            cache: cache.clone(),
            queries: Mutex::new(HashMap::new()),
            breakers: CircuitBreakerRegistry::new(),
            dependencies: Arc::new(DependencyManager::new()),
            observers: Mutex::new(Vec::new()),
            error_reporters: Mutex::new(Vec::new()),
            gc: Mutex::new(None),
            dispose_delay,
        });

        let gc = GarbageCollector::spawn(cache, gc_interval);
        *client.gc.lock().expect("client poisoned") = Some(gc);
        client
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Declares `child` as cancelled whenever `parent` is disposed (spec
    /// section 4.6).
    pub fn register_dependency(&self, parent: &str, child: &str) {
        self.dependencies.register(parent, child);
    }

    pub fn unregister_dependency(&self, parent: &str, child: &str) {
        self.dependencies.unregister(parent, child);
    }

    /// Returns the existing query for `key`, or creates one using `fetch_fn`
    /// and `options`. If a query already exists under a different value
    /// type, fails with `TypeMismatch` rather than silently reinterpreting
    /// it (spec section 4.4). Size estimation for cache bookkeeping falls
    /// back to `crate::cache_entry::estimate_opaque`; use
    /// [`QueryClient::get_query_sized`] to supply a tighter estimator.
    pub fn get_query<T>(
        self: &Arc<Self>,
        key: impl Into<String>,
        fetch_fn: FetchFn<T>,
        options: QueryOptions<T>,
    ) -> Result<Arc<Query<T>>, QueryCacheError>
    where
        T: Clone + Send + Sync + serde::Serialize + 'static,
    {
        self.get_query_sized(key, fetch_fn, options, Arc::new(crate::cache_entry::estimate_opaque))
    }

    pub fn get_query_sized<T>(
        self: &Arc<Self>,
        key: impl Into<String>,
        fetch_fn: FetchFn<T>,
        options: QueryOptions<T>,
        size_estimator: Arc<dyn Fn(&T) -> usize + Send + Sync>,
    ) -> Result<Arc<Query<T>>, QueryCacheError>
    where
        T: Clone + Send + Sync + serde::Serialize + 'static,
    {
        let key = key.into();
        let mut queries = self.queries.lock().expect("client poisoned");
        if let Some(existing) = queries.get(&key) {
            let found = existing.type_name();
            return existing.as_any().downcast_ref::<Arc<Query<T>>>().cloned().ok_or_else(|| {
                QueryCacheError::TypeMismatch {
                    key: key.clone(),
                    expected: std::any::type_name::<T>(),
                    found,
                }
            });
        }

        let sink_weak = Arc::downgrade(self);
        let lookup_weak = sink_weak.clone();
        let remove_weak = sink_weak.clone();

        let query = Query::new(
            QueryInit {
                key: key.clone(),
                fetch_fn,
                options,
                cache: self.cache.clone(),
                breakers: self.breakers.clone(),
                dependencies: self.dependencies.clone(),
                event_sink: Arc::new(ClientEventSink(sink_weak)),
                size_estimator,
                lookup_child_token: Arc::new(move |child_key| {
                    lookup_weak.upgrade().and_then(|client| client.token_for(child_key))
                }),
                remove_self: Arc::new(move |k| {
                    if let Some(client) = remove_weak.upgrade() {
                        client.queries.lock().expect("client poisoned").remove(k);
                    }
                }),
            },
            self.dispose_delay,
        );

        queries.insert(key, Box::new(query.clone()));
        Ok(query)
    }

    pub fn get_query_by_key<T>(&self, key: &str) -> Option<Arc<Query<T>>>
    where
        T: Clone + Send + Sync + serde::Serialize + 'static,
    {
        self.queries
            .lock()
            .expect("client poisoned")
            .get(key)
            .and_then(|q| q.as_any().downcast_ref::<Arc<Query<T>>>().cloned())
    }

    fn token_for(&self, key: &str) -> Option<CancellationToken> {
        self.queries.lock().expect("client poisoned").get(key).and_then(|q| q.current_token())
    }

    /// Write-through to the cache; if a `Query` exists for `key`, also
    /// publishes `Success{fresh}` (spec section 4.4).
    pub fn set_query_data<T>(&self, key: &str, data: T)
    where
        T: Clone + Send + Sync + serde::Serialize + 'static,
    {
        if let Some(query) = self.get_query_by_key::<T>(key) {
            query.set_data(data);
        } else {
            let defaults = self.cache.options().clone();
            let size = crate::cache_entry::estimate_opaque(&data);
            self.cache.set_serialized(key, data, defaults.default_stale_time, defaults.default_cache_time, size);
        }
    }

    /// Read-through the cache without subscribing (spec section 4.4).
    pub fn get_query_data<T>(&self, key: &str) -> Result<Option<T>, QueryCacheError>
    where
        T: Clone + Send + Sync + 'static,
    {
        Ok(self.cache.get::<T>(key)?.map(|entry| entry.data))
    }

    /// Marks the entry stale immediately; triggers a refetch if any
    /// subscriber exists (spec section 4.4).
    pub fn invalidate_query(&self, key: &str) {
        if let Some(query) = self.queries.lock().expect("client poisoned").get(key) {
            query.invalidate();
        }
    }

    pub fn invalidate_with_prefix(&self, prefix: &str) {
        let queries = self.queries.lock().expect("client poisoned");
        for query in queries.values().filter(|q| q.key().starts_with(prefix)) {
            query.invalidate();
        }
    }

    pub fn invalidate_where(&self, predicate: impl Fn(&str) -> bool) {
        let queries = self.queries.lock().expect("client poisoned");
        for query in queries.values().filter(|q| predicate(q.key())) {
            query.invalidate();
        }
    }

    /// Drops `key` from both the registry and the cache (spec section 4.4).
    pub fn remove_query(&self, key: &str) {
        let removed = self.queries.lock().expect("client poisoned").remove(key);
        if let Some(query) = removed {
            query.dispose();
        }
        self.cache.remove(key);
    }

    /// Registers a raw cache-event sink (spec section 6's persistence
    /// bridge); forwards directly to the underlying [`QueryCache`].
    pub fn register_cache_observer(&self, observer: Arc<dyn crate::cache_observer::CacheObserver>) {
        self.cache.register_cache_observer(observer);
    }

    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.lock().expect("client poisoned").push(observer);
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn Observer>) {
        let mut observers = self.observers.lock().expect("client poisoned");
        observers.retain(|registered| !Arc::ptr_eq(registered, observer));
    }

    pub fn register_error_reporter(&self, reporter: Arc<dyn Fn(&QueryCacheError) + Send + Sync>) {
        self.error_reporters.lock().expect("client poisoned").push(reporter);
    }

    /// Dispatches one lifecycle event to every registered observer in
    /// registration order; a panicking observer is logged and does not
    /// prevent the others from running (spec section 4.4). Observers are
    /// cloned out from behind the lock first so a reentrant call from an
    /// observer back into the client cannot deadlock on it.
    fn notify(&self, kind: EventKind, snapshot: &QuerySnapshot, error_ref: Option<&QueryCacheError>) {
        let observers: Vec<Arc<dyn Observer>> = self.observers.lock().expect("client poisoned").clone();
        for observer in &observers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match kind {
                EventKind::Loading => observer.on_loading(snapshot),
                EventKind::Success => observer.on_success(snapshot),
                EventKind::Error => observer.on_error(snapshot, error_ref.expect("error event always carries an error")),
                EventKind::Settled => observer.on_settled(snapshot),
            }));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(key = %snapshot.key, %message, "observer panicked while handling query event");
            }
        }

        if let (EventKind::Error, Some(err)) = (kind, error_ref) {
            let reporters = self.error_reporters.lock().expect("client poisoned").clone();
            for reporter in &reporters {
                reporter(err);
            }
        }
    }

    /// Produces a point-in-time export (spec section 6). `throughput_window`,
    /// when given, also populates `PerformanceSnapshot::throughput` with the
    /// cache's fetch throughput over that trailing window (spec section
    /// 2/4.4); omit it to skip that (slightly more expensive) computation.
    pub fn get_metrics(&self, throughput_window: Option<Duration>) -> PerformanceSnapshot {
        let queries = self.queries.lock().expect("client poisoned");
        let total_queries = queries.len();
        let active_queries = queries.values().filter(|q| q.reference_count() > 0).count();
        let per_query = queries.iter().map(|(key, query)| (key.clone(), query.metrics_snapshot())).collect();
        drop(queries);

        PerformanceSnapshot {
            timestamp: Instant::now(),
            total_queries,
            active_queries,
            memory_bytes: self.cache.info().current_bytes,
            cache: self.cache.info(),
            per_query,
            throughput: throughput_window.map(|window| self.cache.throughput(window)),
        }
    }

    /// Cancels every query, stops the GC sweep, and releases the cache
    /// (spec section 4.4). Terminal.
    pub fn dispose(&self) {
        let queries = std::mem::take(&mut *self.queries.lock().expect("client poisoned"));
        for (_, query) in queries {
            query.dispose();
        }
        if let Some(gc) = self.gc.lock().expect("client poisoned").take() {
            gc.stop();
        }
        self.cache.clear();
    }
}
