use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerOptions;
use crate::eviction::EvictionPolicyKind;

/// Retry/timeout knobs for a single query's fetch pipeline (spec section 6's
/// `performance` group). The data-transform toggles live here too, but the
/// transformer closure itself is carried on [`QueryOptions`] since it is
/// typed in `V` while these knobs are not.
#[derive(Debug, Clone)]
pub struct PerformanceOptions {
    pub enable_metrics: bool,
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub retry_backoff_multiplier: f64,
    pub fetch_timeout: Option<Duration>,
    /// If true, a transform whose input meets `isolate_threshold` runs on a
    /// background worker instead of inline (spec section 4.3).
    pub auto_isolate: bool,
    pub isolate_threshold: Option<usize>,
    pub enable_data_transform: bool,
}

impl Default for PerformanceOptions {
    fn default() -> Self {
        PerformanceOptions {
            enable_metrics: true,
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(200),
            retry_backoff_multiplier: 2.0,
            fetch_timeout: None,
            auto_isolate: false,
            isolate_threshold: None,
            enable_data_transform: false,
        }
    }
}

/// Per-query overrides (spec section 6's `QueryOptions` enumeration).
#[derive(Clone)]
pub struct QueryOptions<V> {
    pub enabled: bool,
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub refetch_on_mount: bool,
    /// If no interval, the query is never refetched while idle in the
    /// background (supplemental to the distilled spec; grounded on the
    /// teacher's `QueryOptions::refetch_interval`).
    pub refetch_interval: Option<Duration>,
    pub circuit_breaker_scope: Option<String>,
    pub circuit_breaker: Option<CircuitBreakerOptions>,
    pub performance: PerformanceOptions,
    pub on_success: Option<Arc<dyn Fn(&V) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&crate::error::QueryCacheError) + Send + Sync>>,
    /// Transforms a freshly fetched value before it is written to the cache
    /// (spec section 4.3). Run inline or on a background worker depending on
    /// `performance.auto_isolate`/`isolate_threshold`; failures fall back
    /// silently to the untransformed value.
    pub data_transformer: Option<Arc<dyn Fn(V) -> V + Send + Sync>>,
    /// Opaque, consulted only by observers for message surfacing; the
    /// engine never reads it.
    pub meta: HashMap<String, String>,
}

impl<V> std::fmt::Debug for QueryOptions<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("refetch_interval", &self.refetch_interval)
            .field("circuit_breaker_scope", &self.circuit_breaker_scope)
            .field("performance", &self.performance)
            .field("has_data_transformer", &self.data_transformer.is_some())
            .field("meta", &self.meta)
            .finish()
    }
}

impl<V> Default for QueryOptions<V> {
    fn default() -> Self {
        QueryOptions {
            enabled: true,
            stale_time: None,
            cache_time: None,
            refetch_on_mount: false,
            refetch_interval: None,
            circuit_breaker_scope: None,
            circuit_breaker: None,
            performance: PerformanceOptions::default(),
            on_success: None,
            on_error: None,
            data_transformer: None,
            meta: HashMap::new(),
        }
    }
}

impl<V> QueryOptions<V> {
    /// Resolves the breaker scope this query falls under, defaulting to the
    /// key string (spec section 4.3: "`scope = options.circuitBreakerScope
    /// ?? key`").
    pub fn resolved_scope<'a>(&'a self, key: &'a str) -> &'a str {
        self.circuit_breaker_scope.as_deref().unwrap_or(key)
    }

    pub fn resolved_stale_time(&self, defaults: &QueryCacheOptions) -> Duration {
        self.stale_time.unwrap_or(defaults.default_stale_time)
    }

    pub fn resolved_cache_time(&self, defaults: &QueryCacheOptions) -> Duration {
        self.cache_time.unwrap_or(defaults.default_cache_time)
    }
}

/// Crate-wide defaults owned by a [`crate::query_cache::QueryCache`] (spec
/// section 6, mirrors the teacher's `DefaultQueryOptions`).
#[derive(Debug, Clone)]
pub struct QueryCacheOptions {
    pub default_stale_time: Duration,
    pub default_cache_time: Duration,
    pub max_entries: Option<usize>,
    pub max_cache_size_bytes: Option<usize>,
    pub default_eviction_policy: EvictionPolicyKind,
    pub gc_sweep_interval: Duration,
    pub default_performance: PerformanceOptions,
    /// Quiescence window between a query's ref-count reaching zero and its
    /// removal (spec section 4.3's "disposal delay").
    pub default_dispose_delay: Duration,
}

impl Default for QueryCacheOptions {
    fn default() -> Self {
        QueryCacheOptions {
            default_stale_time: Duration::from_secs(10),
            default_cache_time: Duration::from_secs(5 * 60),
            max_entries: None,
            max_cache_size_bytes: None,
            default_eviction_policy: EvictionPolicyKind::Lru,
            gc_sweep_interval: Duration::from_secs(60),
            default_performance: PerformanceOptions::default(),
            default_dispose_delay: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_scope_defaults_to_key() {
        let opts: QueryOptions<u32> = QueryOptions::default();
        assert_eq!(opts.resolved_scope("user:1"), "user:1");
    }

    #[test]
    fn resolved_scope_prefers_explicit_override() {
        let opts: QueryOptions<u32> = QueryOptions {
            circuit_breaker_scope: Some("host-a".to_string()),
            ..Default::default()
        };
        assert_eq!(opts.resolved_scope("user:1"), "host-a");
    }

    #[test]
    fn resolved_stale_time_falls_back_to_defaults() {
        let opts: QueryOptions<u32> = QueryOptions::default();
        let defaults = QueryCacheOptions::default();
        assert_eq!(opts.resolved_stale_time(&defaults), defaults.default_stale_time);
    }
}
