#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About
//!
//! An async-query cache engine: a stale-while-revalidate cache for
//! asynchronous data with single-flight fetch deduplication, per-scope
//! circuit breakers, cross-query dependency cancellation, and an observer
//! plane for metrics and persistence.
//!
//! Heavily inspired by [Tanstack Query](https://tanstack.com/query/latest/),
//! generalized here from a single-threaded, UI-framework-scoped cache into a
//! plain `Arc`-shared engine any async runtime task can hold.
//!
//! A [`QueryClient`] provides:
//! - stale-while-revalidate caching with configurable freshness/lifetime per
//!   query
//! - fetch de-duplication (single-flight)
//! - invalidation, by key, by prefix, or by predicate
//! - background refetching and optional refetch intervals
//! - memory management via LRU/LFU eviction and a periodic GC sweep
//! - cooperative cancellation, including cascade-cancel across declared
//!   query dependencies
//! - per-scope circuit breaking around flaky fetch functions
//! - an observer plane for metrics export and cache persistence
//!
//! # A Simple Example
//!
//! ```
//! use std::sync::Arc;
//! use query_cache_engine::*;
//!
//! # async fn run() {
//! let client = QueryClient::new(QueryCacheOptions::default());
//!
//! let fetch_fn: FetchFn<String> = Arc::new(|_token| {
//!     Box::pin(async { Ok::<_, Box<dyn std::error::Error + Send + Sync>>("hello".to_string()) })
//! });
//!
//! let query = client
//!     .get_query("greeting", fetch_fn, QueryOptions::default())
//!     .expect("value type matches");
//! let _receiver = query.subscribe();
//! # }
//! ```

mod cache_entry;
mod cache_observer;
mod cancellation;
mod circuit_breaker;
mod circuit_breaker_registry;
mod dependency_manager;
mod encryption;
mod error;
mod eviction;
mod gc;
mod instant;
mod key;
mod metrics;
mod metrics_exporter;
mod observer;
mod persistence;
mod query;
mod query_cache;
mod query_client;
mod query_options;
mod query_state;
mod retry;
mod transform;

pub use cache_entry::{CacheEntry, EstimateSize};
pub use cache_observer::{CacheEvent, CacheObserver, QueryCacheKey, QueryCachePayload};
pub use cancellation::CancellationToken;
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerOptions};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use dependency_manager::DependencyManager;
pub use encryption::{EncryptionError, EncryptionProvider};
pub use error::QueryCacheError;
pub use eviction::{EvictionCandidate, EvictionPolicy, EvictionPolicyKind, Fifo, Lfu, Lru};
pub use gc::GarbageCollector;
pub use instant::Instant;
pub use key::QueryKey;
pub use metrics::{CacheInfo, CacheMetrics, ThroughputSnapshot};
pub use metrics_exporter::{ExportError, MetricsExporter, PerformanceSnapshot, QueryMetricsSnapshot};
pub use observer::{Observer, QuerySnapshot};
pub use persistence::{PersistenceError, PersistenceProvider};
pub use query::{legacy_fetch_fn, FetchFn, FetchFuture, Query, QueryEventSink, QueryInit};
pub use query_cache::QueryCache;
pub use query_client::QueryClient;
pub use query_options::{PerformanceOptions, QueryCacheOptions, QueryOptions};
pub use query_state::{ErrorState, QueryState, SuccessState};
pub use retry::{exponential_backoff, no_retry, retry, BoxedSchedule, RetrySchedule};
