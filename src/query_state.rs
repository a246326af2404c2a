use std::sync::Arc;

use crate::error::QueryCacheError;
use crate::instant::Instant;

/// The lifecycle of a query (spec section 3).
///
/// Unlike the teacher's `Created/Loading/Fetching/Loaded/Invalid` variant
/// set, `isFetching` and `isStale` are orthogonal flags carried *inside*
/// `Success` rather than separate variants, so a background refresh of
/// stale data is representable as a single state (`Success` with both flags
/// true) instead of a distinct `Fetching` variant.
#[derive(Clone)]
pub enum QueryState<V> {
    /// No fetch has ever been attempted for this query.
    Idle,
    /// A fetch is in flight and no data has ever been observed.
    Loading,
    Success(SuccessState<V>),
    Error(ErrorState),
}

#[derive(Clone)]
pub struct SuccessState<V> {
    pub data: V,
    pub data_updated_at: Instant,
    /// True once `staleTime` has elapsed since `data_updated_at`.
    pub is_stale: bool,
    /// True while a background (or foreground) refresh is in flight on top
    /// of this data.
    pub is_fetching: bool,
    /// False for a placeholder value (spec section 3's `hasValue`); true for
    /// every value actually produced by a fetch or `set_query_data`.
    pub has_value: bool,
    /// Set when a background refresh on top of this data failed (spec
    /// section 4.3: "attach `error` to state; do **not** transition to the
    /// Error variant"). Cleared on the next successful fetch.
    pub last_error: Option<Arc<QueryCacheError>>,
}

#[derive(Clone)]
pub struct ErrorState {
    pub error: Arc<QueryCacheError>,
    /// Data retained from a prior success, if a background refresh failed
    /// (spec section 4.3's "background fetch error: keep previous data").
    /// When this is `Some`, callers typically prefer to stay on the old
    /// `Success` state rather than surface `Error`; this variant exists for
    /// the foreground-failure case, where no prior data exists.
    pub is_fetching: bool,
}

impl<V> QueryState<V> {
    pub fn is_idle(&self) -> bool {
        matches!(self, QueryState::Idle)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, QueryState::Loading)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, QueryState::Error(_))
    }

    pub fn is_fetching(&self) -> bool {
        match self {
            QueryState::Loading => true,
            QueryState::Success(s) => s.is_fetching,
            QueryState::Error(e) => e.is_fetching,
            QueryState::Idle => false,
        }
    }

    pub fn is_stale(&self) -> bool {
        match self {
            QueryState::Success(s) => s.is_stale,
            _ => false,
        }
    }

    pub fn data(&self) -> Option<&V> {
        match self {
            QueryState::Success(s) if s.has_value => Some(&s.data),
            _ => None,
        }
    }

    pub fn data_updated_at(&self) -> Option<Instant> {
        match self {
            QueryState::Success(s) => Some(s.data_updated_at),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&QueryCacheError> {
        match self {
            QueryState::Error(e) => Some(&e.error),
            _ => None,
        }
    }

    pub fn success(data: V, is_stale: bool) -> Self {
        QueryState::Success(SuccessState {
            data,
            data_updated_at: Instant::now(),
            is_stale,
            is_fetching: false,
            has_value: true,
            last_error: None,
        })
    }

    /// Marks a `Success` state as currently refreshing, preserving its data
    /// (spec section 4.3 step 4: "publish `Success{existing data,
    /// isFetching=true, isStale=...}`").
    pub(crate) fn with_fetching(mut self, is_fetching: bool) -> Self {
        if let QueryState::Success(s) = &mut self {
            s.is_fetching = is_fetching;
        }
        self
    }

    /// Attaches a background-fetch failure to a `Success` state without
    /// leaving the variant (spec section 4.3: "Background fetch error: keep
    /// previous data... attach `error` to state; do **not** transition to
    /// the Error variant"). A no-op on any other variant.
    pub(crate) fn with_background_error(mut self, error: Arc<QueryCacheError>) -> Self {
        if let QueryState::Success(s) = &mut self {
            s.is_fetching = false;
            s.last_error = Some(error);
        }
        self
    }

    pub(crate) fn map<R>(self, mapper: impl FnOnce(V) -> R) -> QueryState<R> {
        match self {
            QueryState::Idle => QueryState::Idle,
            QueryState::Loading => QueryState::Loading,
            QueryState::Error(e) => QueryState::Error(e),
            QueryState::Success(s) => QueryState::Success(SuccessState {
                data: mapper(s.data),
                data_updated_at: s.data_updated_at,
                is_stale: s.is_stale,
                is_fetching: s.is_fetching,
                has_value: s.has_value,
                last_error: s.last_error,
            }),
        }
    }
}

impl<V> Default for QueryState<V> {
    fn default() -> Self {
        QueryState::Idle
    }
}

impl<V: std::fmt::Debug> std::fmt::Debug for QueryState<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryState::Idle => write!(f, "Idle"),
            QueryState::Loading => write!(f, "Loading"),
            QueryState::Success(s) => f
                .debug_struct("Success")
                .field("data", &s.data)
                .field("is_stale", &s.is_stale)
                .field("is_fetching", &s.is_fetching)
                .field("has_value", &s.has_value)
                .field("last_error", &s.last_error)
                .finish(),
            QueryState::Error(e) => f
                .debug_struct("Error")
                .field("error", &e.error)
                .field("is_fetching", &e.is_fetching)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_has_no_data_and_is_not_fetching() {
        let state: QueryState<u32> = QueryState::Idle;
        assert!(state.data().is_none());
        assert!(!state.is_fetching());
    }

    #[test]
    fn success_with_fetching_preserves_data() {
        let state = QueryState::success(42, true).with_fetching(true);
        assert_eq!(state.data(), Some(&42));
        assert!(state.is_fetching());
        assert!(state.is_stale());
    }

    #[test]
    fn map_transforms_success_data_only() {
        let state = QueryState::success(2, false).map(|v| v * 10);
        assert_eq!(state.data(), Some(&20));

        let loading: QueryState<u32> = QueryState::Loading;
        let mapped = loading.map(|v| v * 10);
        assert!(mapped.is_loading());
    }

    #[test]
    fn background_error_attaches_without_leaving_success() {
        let state = QueryState::success(7, false)
            .with_fetching(true)
            .with_background_error(Arc::new(QueryCacheError::Cancelled("x".into())));
        assert!(!state.is_error());
        assert_eq!(state.data(), Some(&7));
        assert!(!state.is_fetching());
        match &state {
            QueryState::Success(s) => assert!(s.last_error.is_some()),
            _ => panic!("expected Success"),
        }
    }

    #[test]
    fn error_state_carries_no_value() {
        let state: QueryState<u32> = QueryState::Error(ErrorState {
            error: Arc::new(QueryCacheError::Cancelled("x".into())),
            is_fetching: false,
        });
        assert!(state.data().is_none());
        assert!(state.is_error());
    }
}
