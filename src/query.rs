use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cancellation::CancellationToken;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::dependency_manager::DependencyManager;
use crate::error::QueryCacheError;
use crate::metrics_exporter::QueryMetricsSnapshot;
use crate::observer::{self, QuerySnapshot};
use crate::query_cache::QueryCache;
use crate::query_options::QueryOptions;
use crate::query_state::{ErrorState, QueryState};
use crate::retry;
use crate::transform;

/// A user fetch function's future (spec section 6): the user's own error
/// type is boxed rather than forced into [`QueryCacheError`] so that fetch
/// functions stay ordinary `async fn`s returning whatever error suits the
/// caller. The pipeline wraps a rejection into `QueryCacheError::FetchFailed`
/// at the single point it is observed.
pub type FetchFuture<T> = BoxFuture<'static, Result<T, Box<dyn std::error::Error + Send + Sync>>>;

/// `fetch_fn: (CancellationToken) -> Future<T>` (spec section 6).
pub type FetchFn<T> = Arc<dyn Fn(CancellationToken) -> FetchFuture<T> + Send + Sync>;

/// Adapts a legacy fetch function that takes no [`CancellationToken`] (spec
/// section 6: "A legacy form without the token parameter is accepted and
/// invoked without cancellation support").
pub fn legacy_fetch_fn<T, F, Fut, E>(f: F) -> FetchFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    T: Send + 'static,
{
    Arc::new(move |_token: CancellationToken| {
        let fut = f();
        Box::pin(async move { fut.await.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>) })
            as FetchFuture<T>
    })
}

/// Fan-out sink for query lifecycle events (spec sections 4.4/6).
/// Implemented by [`crate::query_client::QueryClient`], which dispatches to
/// every registered [`crate::observer::Observer`] in registration order. A
/// trait boundary (rather than a direct dependency on `QueryClient`) keeps
/// `Query<T>` ignorant of the registry that owns it.
pub trait QueryEventSink: Send + Sync {
    fn dispatch_loading(&self, snapshot: QuerySnapshot);
    fn dispatch_success(&self, snapshot: QuerySnapshot);
    fn dispatch_error(&self, snapshot: QuerySnapshot, error: Arc<QueryCacheError>);
    fn dispatch_settled(&self, snapshot: QuerySnapshot);
}

const QUERY_METRICS_HISTORY_CAPACITY: usize = 100;

#[derive(Default)]
struct QueryMetrics {
    fetch_count: u64,
    last_duration: Option<Duration>,
    max_duration: Duration,
    history: VecDeque<Duration>,
}

impl QueryMetrics {
    fn record(&mut self, duration: Duration) {
        self.fetch_count += 1;
        self.last_duration = Some(duration);
        self.max_duration = self.max_duration.max(duration);
        if self.history.len() == QUERY_METRICS_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(duration);
    }

    fn snapshot(&self, reference_count: u32) -> QueryMetricsSnapshot {
        let average = if self.history.is_empty() {
            Duration::ZERO
        } else {
            let total: Duration = self.history.iter().sum();
            total / self.history.len() as u32
        };
        QueryMetricsSnapshot {
            fetch_count: self.fetch_count,
            average_fetch_duration: average,
            max_fetch_duration: self.max_duration,
            last_fetch_duration: self.last_duration,
            fetch_history: self.history.iter().copied().collect(),
            reference_count,
        }
    }
}

/// Dependencies a [`crate::query_client::QueryClient`] wires into every
/// `Query` it creates. Bundled into one struct since `Query::new` would
/// otherwise take a dozen positional arguments.
pub struct QueryInit<T> {
    pub key: String,
    pub fetch_fn: FetchFn<T>,
    pub options: QueryOptions<T>,
    pub cache: Arc<QueryCache>,
    pub breakers: CircuitBreakerRegistry,
    pub dependencies: Arc<DependencyManager>,
    pub event_sink: Arc<dyn QueryEventSink>,
    /// Computes the estimated byte footprint of a freshly (transformed)
    /// fetched value for `QueryCache::set`. Callers that have a type
    /// implementing [`crate::cache_entry::EstimateSize`] typically pass
    /// `Arc::new(|v: &T| v.estimate_size())`; others fall back to
    /// `crate::cache_entry::estimate_opaque`.
    pub size_estimator: Arc<dyn Fn(&T) -> usize + Send + Sync>,
    /// Resolves a child query key to its live cancellation token, for
    /// cascade-cancel on disposal (spec section 4.6). Backed by the client's
    /// query registry.
    pub lookup_child_token: Arc<dyn Fn(&str) -> Option<CancellationToken> + Send + Sync>,
    /// Removes this query from the client's registry once disposed.
    pub remove_self: Arc<dyn Fn(&str) + Send + Sync>,
}

/// The per-key state machine (spec section 4.3).
///
/// Unlike the teacher's `Rc<RefCell<_>>`-based `Query<K, V>`, every piece of
/// mutable state here is guarded by its own `std::sync::Mutex` (or, for the
/// published state itself, a `tokio::sync::watch` channel) so `Query<T>` is
/// `Send + Sync` and can be shared across a multi-threaded runtime — spec
/// section 5's "single reentrant guard per QueryCache/CircuitBreaker"
/// extended to the query level. No `.await` is held across any of these
/// locks.
pub struct Query<T> {
    key: String,
    fetch_fn: FetchFn<T>,
    options: Mutex<QueryOptions<T>>,
    cache: Arc<QueryCache>,
    breakers: CircuitBreakerRegistry,
    dependencies: Arc<DependencyManager>,
    event_sink: Arc<dyn QueryEventSink>,
    size_estimator: Arc<dyn Fn(&T) -> usize + Send + Sync>,
    lookup_child_token: Arc<dyn Fn(&str) -> Option<CancellationToken> + Send + Sync>,
    remove_self: Arc<dyn Fn(&str) + Send + Sync>,
    ref_count: Mutex<u32>,
    state_tx: watch::Sender<QueryState<T>>,
    current_token: Mutex<Option<CancellationToken>>,
    dispose_timer: Mutex<Option<JoinHandle<()>>>,
    dispose_delay: Duration,
    metrics: Mutex<QueryMetrics>,
    disposed: AtomicBool,
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + serde::Serialize + 'static,
{
    /// Constructs a query. Initial state (spec section 4.3): if the cache
    /// already holds an entry for this key, publish `Success` with
    /// `isStale` reflecting that entry's freshness; otherwise `Idle` (the
    /// first `subscribe` drives the `Idle -> Loading` transition by calling
    /// `fetch`).
    pub fn new(init: QueryInit<T>, dispose_delay: Duration) -> Arc<Self> {
        let initial = match init.cache.peek::<T>(&init.key) {
            Some(entry) if entry.has_value => QueryState::success(entry.data, entry.is_stale()),
            _ => QueryState::Idle,
        };
        let (state_tx, _rx) = watch::channel(initial);

        Arc::new(Query {
            key: init.key,
            fetch_fn: init.fetch_fn,
            options: Mutex::new(init.options),
            cache: init.cache,
            breakers: init.breakers,
            dependencies: init.dependencies,
            event_sink: init.event_sink,
            size_estimator: init.size_estimator,
            lookup_child_token: init.lookup_child_token,
            remove_self: init.remove_self,
            ref_count: Mutex::new(0),
            state_tx,
            current_token: Mutex::new(None),
            dispose_timer: Mutex::new(None),
            dispose_delay,
            metrics: Mutex::new(QueryMetrics::default()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> QueryState<T> {
        self.state_tx.borrow().clone()
    }

    pub fn options(&self) -> QueryOptions<T> {
        self.options.lock().expect("query poisoned").clone()
    }

    pub fn set_options(&self, options: QueryOptions<T>) {
        *self.options.lock().expect("query poisoned") = options;
    }

    pub fn metrics_snapshot(&self) -> QueryMetricsSnapshot {
        self.metrics.lock().expect("query poisoned").snapshot(self.reference_count())
    }

    pub fn reference_count(&self) -> u32 {
        *self.ref_count.lock().expect("query poisoned")
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// The token guarding the current (or most recent) fetch attempt, used
    /// by [`crate::query_client::QueryClient`] to resolve cascade-cancel
    /// lookups for dependent children (spec section 4.6).
    pub fn current_token(&self) -> Option<CancellationToken> {
        self.current_token.lock().expect("query poisoned").clone()
    }

    /// Adds a subscriber (spec section 4.3's "Subscription contract"):
    /// increments the ref-count, cancels any pending disposal timer, and —
    /// the first time ref-count leaves zero — kicks off a fetch if the
    /// query has never been fetched, or if `refetchOnMount` is set.
    pub fn subscribe(self: &Arc<Self>) -> watch::Receiver<QueryState<T>> {
        let became_active = {
            let mut count = self.ref_count.lock().expect("query poisoned");
            *count += 1;
            *count == 1
        };
        if let Some(handle) = self.dispose_timer.lock().expect("query poisoned").take() {
            handle.abort();
        }
        self.cache.set_reference_count(&self.key, self.reference_count());

        let receiver = self.state_tx.subscribe();

        if became_active {
            let should_fetch =
                self.state_tx.borrow().is_idle() || self.options.lock().expect("query poisoned").refetch_on_mount;
            if should_fetch {
                let this = self.clone();
                tokio::spawn(async move { this.fetch(false).await });
            }
        }

        receiver
    }

    /// Removes a subscriber; schedules disposal once the ref-count reaches
    /// zero.
    pub fn unsubscribe(self: &Arc<Self>) {
        let became_idle = {
            let mut count = self.ref_count.lock().expect("query poisoned");
            *count = count.saturating_sub(1);
            *count == 0
        };
        self.cache.set_reference_count(&self.key, self.reference_count());
        if became_idle {
            self.schedule_dispose();
        }
    }

    fn schedule_dispose(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.dispose_delay).await;
            this.dispose();
        });
        *self.dispose_timer.lock().expect("query poisoned") = Some(handle);
    }

    /// Terminal: cancels any in-flight fetch, cascades cancellation to
    /// dependent children, stops the disposal timer, and removes this query
    /// from the client's registry (spec section 4.3). Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.current_token.lock().expect("query poisoned").take() {
            token.cancel();
        }
        self.dependencies.cascade_cancel(&self.key, |child| (self.lookup_child_token)(child));
        if let Some(handle) = self.dispose_timer.lock().expect("query poisoned").take() {
            handle.abort();
        }
        // Dropping the last `Arc<Query<T>>` closes `state_tx`'s receivers;
        // removing from the registry here ensures that happens promptly
        // once the caller's own handle goes out of scope.
        (self.remove_self)(&self.key);
    }

    /// Write-through used by `QueryClient::set_query_data` (spec section
    /// 4.4): writes `data` to the cache and publishes `Success{fresh}`.
    pub fn set_data(&self, data: T) {
        let options = self.options.lock().expect("query poisoned").clone();
        let cache_defaults = self.cache.options().clone();
        let size_bytes = (self.size_estimator)(&data);
        self.cache.set_serialized(
            &self.key,
            data.clone(),
            options.resolved_stale_time(&cache_defaults),
            options.resolved_cache_time(&cache_defaults),
            size_bytes,
        );
        let previous = self.state_tx.send_replace(QueryState::success(data, false));
        let current = self.state_tx.borrow().clone();
        self.dispatch_success(&previous, &current);
        self.dispatch_settled(&previous, &current);
    }

    /// Marks the entry stale immediately and, if any subscriber is attached,
    /// triggers a background refetch (spec section 4.4's `invalidate_query`).
    pub fn invalidate(self: &Arc<Self>) {
        {
            let mut state = self.state_tx.borrow().clone();
            if let QueryState::Success(s) = &mut state {
                if !s.is_stale {
                    s.is_stale = true;
                    self.state_tx.send_replace(state);
                }
            }
        }
        if self.reference_count() > 0 {
            let this = self.clone();
            tokio::spawn(async move { this.fetch(false).await });
        }
    }

    /// Drives the state machine described in spec section 4.3.
    pub async fn fetch(self: &Arc<Self>, force_refetch: bool) {
        if self.is_disposed() {
            return;
        }
        let options = self.options.lock().expect("query poisoned").clone();
        if !options.enabled {
            return;
        }

        let token = CancellationToken::new();
        {
            let mut current = self.current_token.lock().expect("query poisoned");
            if let Some(prev) = current.replace(token.clone()) {
                prev.cancel();
            }
        }

        let cached = self.cache.peek::<T>(&self.key);
        let is_fresh = cached.as_ref().is_some_and(|entry| entry.is_fresh());

        if let Some(entry) = &cached {
            if is_fresh && !force_refetch {
                let previous = self.state_tx.send_replace(QueryState::success(entry.data.clone(), false));
                let current = self.state_tx.borrow().clone();
                self.dispatch_success(&previous, &current);
                self.dispatch_settled(&previous, &current);
                return;
            }
        }

        let had_previous = cached.is_some();
        let loading_state = match &cached {
            Some(entry) => QueryState::success(entry.data.clone(), !force_refetch).with_fetching(true),
            None => QueryState::Loading,
        };
        let previous = self.state_tx.send_replace(loading_state);
        let current = self.state_tx.borrow().clone();
        self.dispatch_loading(&previous, &current);

        self.run_real_fetch(options, token, had_previous).await;
    }

    /// `token check -> circuit breaker gate -> retry loop -> timeout ->
    /// user fn -> transform -> cache.set` (spec section 4.3.2).
    async fn run_real_fetch(self: &Arc<Self>, options: QueryOptions<T>, token: CancellationToken, had_previous: bool) {
        let cache_defaults = self.cache.options().clone();
        let scope = options.resolved_scope(&self.key).to_string();
        let breaker = self
            .breakers
            .get_or_create(&scope, options.circuit_breaker.clone().unwrap_or_default());
        let schedule = retry::exponential_backoff(
            options.performance.initial_retry_delay,
            options.performance.retry_backoff_multiplier,
            options.performance.max_retries,
        );
        let timeout = options.performance.fetch_timeout;
        let fetch_fn = self.fetch_fn.clone();
        let key = self.key.clone();

        let started = std::time::Instant::now();

        let outer_token = token.clone();
        let outer_fetch_fn = fetch_fn.clone();
        let outer_breaker = breaker.clone();
        let outer_key = key.clone();
        let result: Result<Arc<T>, Arc<QueryCacheError>> = self
            .cache
            .deduplicate(&key, move || async move {
                retry::retry(schedule, move || {
                    let token = outer_token.clone();
                    let fetch_fn = outer_fetch_fn.clone();
                    let breaker = outer_breaker.clone();
                    let key = outer_key.clone();
                    async move {
                        if token.is_cancelled() {
                            return Err(QueryCacheError::Cancelled(key));
                        }
                        breaker.allow_request()?;
                        let raw = fetch_fn(token.clone());
                        let outcome = match timeout {
                            Some(d) => match tokio::time::timeout(d, raw).await {
                                Ok(r) => r.map_err(|source| QueryCacheError::FetchFailed {
                                    key: key.clone(),
                                    source,
                                }),
                                Err(_) => {
                                    token.cancel();
                                    Err(QueryCacheError::Timeout { key: key.clone(), elapsed: d })
                                }
                            },
                            None => raw.await.map_err(|source| QueryCacheError::FetchFailed {
                                key: key.clone(),
                                source,
                            }),
                        };
                        breaker.record_outcome(outcome.as_ref().err());
                        outcome
                    }
                })
                .await
            })
            .await;

        let elapsed = started.elapsed();
        self.cache.metrics().record_fetch_latency(elapsed);
        self.metrics.lock().expect("query poisoned").record(elapsed);

        match result {
            Ok(value) => {
                let raw = (*value).clone();
                let size_bytes = (self.size_estimator)(&raw);
                let data = transform::apply_transform(&options, size_bytes, raw).await;
                let size_bytes = (self.size_estimator)(&data);
                self.cache.set_serialized(
                    &key,
                    data.clone(),
                    options.resolved_stale_time(&cache_defaults),
                    options.resolved_cache_time(&cache_defaults),
                    size_bytes,
                );
                if let Some(on_success) = &options.on_success {
                    on_success(&data);
                }
                let previous = self.state_tx.send_replace(QueryState::success(data, false));
                let current = self.state_tx.borrow().clone();
                self.dispatch_success(&previous, &current);
                self.dispatch_settled(&previous, &current);
            }
            Err(err) => {
                if err.is_cancelled() {
                    return;
                }
                if let Some(on_error) = &options.on_error {
                    on_error(&err);
                }
                let (previous, current) = if had_previous {
                    let previous = self.state_tx.borrow().clone();
                    let next = previous.clone().with_background_error(err.clone());
                    self.state_tx.send_replace(next);
                    (previous, self.state_tx.borrow().clone())
                } else {
                    let previous = self.state_tx.send_replace(QueryState::Error(ErrorState {
                        error: err.clone(),
                        is_fetching: false,
                    }));
                    (previous, self.state_tx.borrow().clone())
                };
                self.dispatch_error(&previous, &current, err);
                self.dispatch_settled(&previous, &current);
            }
        }
    }

    fn snapshot(&self, previous: &QueryState<T>, current: &QueryState<T>) -> QuerySnapshot {
        let meta = self.options.lock().expect("query poisoned").meta.clone();
        QuerySnapshot {
            key: self.key.clone(),
            previous_state: observer::erase_state(previous),
            current_state: observer::erase_state(current),
            is_stale: current.is_stale(),
            is_fetching: current.is_fetching(),
            meta,
        }
    }

    fn dispatch_loading(&self, previous: &QueryState<T>, current: &QueryState<T>) {
        self.event_sink.dispatch_loading(self.snapshot(previous, current));
    }

    fn dispatch_success(&self, previous: &QueryState<T>, current: &QueryState<T>) {
        self.event_sink.dispatch_success(self.snapshot(previous, current));
    }

    fn dispatch_error(&self, previous: &QueryState<T>, current: &QueryState<T>, error: Arc<QueryCacheError>) {
        self.event_sink.dispatch_error(self.snapshot(previous, current), error);
    }

    fn dispatch_settled(&self, previous: &QueryState<T>, current: &QueryState<T>) {
        self.event_sink.dispatch_settled(self.snapshot(previous, current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerOptions;
    use crate::query_options::{PerformanceOptions, QueryCacheOptions};
    use std::sync::atomic::AtomicUsize;

    struct RecordingSink {
        loading: AtomicUsize,
        success: AtomicUsize,
        error: AtomicUsize,
        settled: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSink {
                loading: AtomicUsize::new(0),
                success: AtomicUsize::new(0),
                error: AtomicUsize::new(0),
                settled: AtomicUsize::new(0),
            })
        }
    }

    impl QueryEventSink for RecordingSink {
        fn dispatch_loading(&self, _snapshot: QuerySnapshot) {
            self.loading.fetch_add(1, Ordering::SeqCst);
        }
        fn dispatch_success(&self, _snapshot: QuerySnapshot) {
            self.success.fetch_add(1, Ordering::SeqCst);
        }
        fn dispatch_error(&self, _snapshot: QuerySnapshot, _error: Arc<QueryCacheError>) {
            self.error.fetch_add(1, Ordering::SeqCst);
        }
        fn dispatch_settled(&self, _snapshot: QuerySnapshot) {
            self.settled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn make_query(
        cache: Arc<QueryCache>,
        sink: Arc<RecordingSink>,
        fetch_fn: FetchFn<u32>,
        options: QueryOptions<u32>,
    ) -> Arc<Query<u32>> {
        Query::new(
            QueryInit {
                key: "k".to_string(),
                fetch_fn,
                options,
                cache,
                breakers: CircuitBreakerRegistry::new(),
                dependencies: Arc::new(DependencyManager::new()),
                event_sink: sink,
                size_estimator: Arc::new(|_: &u32| 4),
                lookup_child_token: Arc::new(|_| None),
                remove_self: Arc::new(|_| {}),
            },
            Duration::from_millis(5),
        )
    }

    fn counting_fetch_fn(calls: Arc<AtomicUsize>, value: u32) -> FetchFn<u32> {
        Arc::new(move |_token| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Box<dyn std::error::Error + Send + Sync>>(value)
            })
        })
    }

    fn failing_fetch_fn(calls: Arc<AtomicUsize>) -> FetchFn<u32> {
        Arc::new(move |_token| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Box::<dyn std::error::Error + Send + Sync>::from("boom"))
            })
        })
    }

    fn no_retry_options() -> QueryOptions<u32> {
        QueryOptions {
            performance: PerformanceOptions {
                max_retries: 0,
                initial_retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn absent_entry_goes_idle_then_loading_then_success() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = make_query(cache, sink.clone(), counting_fetch_fn(calls.clone(), 7), no_retry_options());

        assert!(query.state().is_idle());
        query.fetch(false).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.state().data(), Some(&7));
        assert_eq!(sink.loading.load(Ordering::SeqCst), 1);
        assert_eq!(sink.success.load(Ordering::SeqCst), 1);
        assert_eq!(sink.settled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_cache_entry_is_served_without_a_real_fetch() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        cache.set("k", 42u32, Duration::from_secs(60), Duration::from_secs(120), 4);
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = make_query(cache, sink.clone(), counting_fetch_fn(calls.clone(), 0), no_retry_options());

        query.fetch(false).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0, "a fresh entry must not trigger a real fetch");
        assert_eq!(query.state().data(), Some(&42));
        assert_eq!(sink.success.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_entry_refreshes_in_background_then_publishes_fresh() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        cache.set("k", 1u32, Duration::ZERO, Duration::from_secs(120), 4);
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = make_query(cache, sink.clone(), counting_fetch_fn(calls.clone(), 2), no_retry_options());

        query.fetch(false).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.state().data(), Some(&2));
        assert!(!query.state().is_stale());
    }

    #[tokio::test]
    async fn foreground_fetch_error_transitions_to_error_state() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = make_query(cache, sink.clone(), failing_fetch_fn(calls.clone()), no_retry_options());

        query.fetch(false).await;

        assert!(query.state().is_error());
        assert_eq!(sink.error.load(Ordering::SeqCst), 1);
        assert_eq!(sink.settled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_fetch_error_preserves_previous_data() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        cache.set("k", 9u32, Duration::ZERO, Duration::from_secs(120), 4);
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = make_query(cache, sink.clone(), failing_fetch_fn(calls.clone()), no_retry_options());

        query.fetch(false).await;

        assert!(!query.state().is_error(), "background failure must not leave Success");
        assert_eq!(query.state().data(), Some(&9));
        assert!(!query.state().is_fetching());
        match query.state() {
            QueryState::Success(s) => assert!(s.last_error.is_some()),
            _ => panic!("expected Success"),
        }
    }

    #[tokio::test]
    async fn circuit_breaker_open_short_circuits_without_calling_fetch_fn() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = QueryOptions {
            circuit_breaker: Some(CircuitBreakerOptions {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(30),
                ..Default::default()
            }),
            ..no_retry_options()
        };
        let query = make_query(cache, sink.clone(), failing_fetch_fn(calls.clone()), options);

        query.fetch(false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        query.fetch(true).await;
        // The breaker opened after the first failure; the second fetch must
        // fail fast without invoking the user fetch function again.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_from_idle_drives_a_fetch() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = make_query(cache, sink.clone(), counting_fetch_fn(calls.clone(), 5), no_retry_options());

        let _rx = query.subscribe();
        // subscribe() spawns the fetch; give it a chance to run.
        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.reference_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_to_zero_schedules_disposal() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));
        let disposed2 = disposed.clone();
        let query = Query::new(
            QueryInit {
                key: "k".to_string(),
                fetch_fn: counting_fetch_fn(calls, 1),
                options: no_retry_options(),
                cache,
                breakers: CircuitBreakerRegistry::new(),
                dependencies: Arc::new(DependencyManager::new()),
                event_sink: sink,
                size_estimator: Arc::new(|_: &u32| 4),
                lookup_child_token: Arc::new(|_| None),
                remove_self: Arc::new(move |_| {
                    disposed2.fetch_add(1, Ordering::SeqCst);
                }),
            },
            Duration::from_millis(10),
        );

        let _rx = query.subscribe();
        query.unsubscribe();
        assert_eq!(disposed.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(25)).await;
        tokio::task::yield_now().await;
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(query.is_disposed());
    }

    #[tokio::test]
    async fn resubscribing_before_dispose_delay_elapses_cancels_the_timer() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = make_query(cache, sink.clone(), counting_fetch_fn(calls.clone(), 1), no_retry_options());

        let rx1 = query.subscribe();
        query.unsubscribe();
        let _rx2 = query.subscribe();
        drop(rx1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!query.is_disposed(), "resubscribing should have cancelled the pending disposal");
    }

    #[tokio::test]
    async fn dispose_cancels_dependency_children() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let dependencies = Arc::new(DependencyManager::new());
        dependencies.register("k", "child");
        let child_token = CancellationToken::new();
        let child_token2 = child_token.clone();

        let query = Query::new(
            QueryInit {
                key: "k".to_string(),
                fetch_fn: counting_fetch_fn(calls, 1),
                options: no_retry_options(),
                cache,
                breakers: CircuitBreakerRegistry::new(),
                dependencies,
                event_sink: sink,
                size_estimator: Arc::new(|_: &u32| 4),
                lookup_child_token: Arc::new(move |key| if key == "child" { Some(child_token2.clone()) } else { None }),
                remove_self: Arc::new(|_| {}),
            },
            Duration::from_millis(5),
        );

        query.dispose();
        assert!(child_token.is_cancelled());
    }

    #[tokio::test]
    async fn set_data_publishes_fresh_success_and_writes_through_cache() {
        let cache = Arc::new(QueryCache::new(QueryCacheOptions::default()));
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = make_query(cache.clone(), sink.clone(), counting_fetch_fn(calls, 0), no_retry_options());

        query.set_data(99);
        assert_eq!(query.state().data(), Some(&99));
        assert_eq!(cache.get::<u32>("k").unwrap().unwrap().data, 99);
        assert_eq!(sink.success.load(Ordering::SeqCst), 1);
    }
}
