use std::time::Duration;

/// Error taxonomy for the engine (spec section 7).
///
/// `Cancelled` is never surfaced to an observer or subscriber: it exists so
/// the fetch pipeline's internal `Result` plumbing has a place to put
/// "the fetch was superseded", it is filtered out before anything touches
/// `Query::set_state`.
#[derive(Debug, thiserror::Error)]
pub enum QueryCacheError {
    /// The user-supplied fetch function returned an error.
    #[error("fetch failed for key {key}: {source}")]
    FetchFailed {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The fetch was superseded by cancellation. Absorbed silently by the
    /// engine; never reaches an observer.
    #[error("fetch for key {0} was cancelled")]
    Cancelled(String),

    /// `options.performance.fetch_timeout` elapsed before the fetch
    /// completed.
    #[error("fetch for key {key} timed out after {elapsed:?}")]
    Timeout { key: String, elapsed: Duration },

    /// The circuit breaker for `scope` is open and not yet past its reset
    /// timeout.
    #[error("circuit breaker open for scope {scope}")]
    CircuitBreakerOpen { scope: String },

    /// `QueryClient::get_query` was called with a value type that does not
    /// match the type already registered for this key.
    #[error("query {key} is registered with a different value type (expected {expected}, found {found})")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The configured data transformer failed; the untransformed value was
    /// used instead. Never propagated out of the engine — recorded here only
    /// so callers that inspect a `tracing` event or metrics counter have a
    /// named cause.
    #[error("data transform failed for key {0}")]
    TransformFailed(String),
}

impl QueryCacheError {
    /// True for the two error kinds the spec forbids from advancing a
    /// circuit breaker's counters under normal accounting (`Cancelled`) or
    /// from ever being retried (`CircuitBreakerOpen`).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryCacheError::Cancelled(_))
    }

    pub fn is_circuit_breaker_open(&self) -> bool {
        matches!(self, QueryCacheError::CircuitBreakerOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, QueryCacheError::Timeout { .. })
    }
}
