use std::collections::HashMap;

use crate::error::QueryCacheError;
use crate::query_state::QueryState;

/// A point-in-time view of a single query's state transition, handed to
/// every registered [`Observer`] (spec section 6).
///
/// `previous_state`/`current_state` are erased to `serde_json::Value` via
/// `serde_json::to_value` rather than kept as `QueryState<V>` because a
/// single `Observer` is registered once on the `QueryClient` and fans out
/// across every live query's `V`, not just one (mirrors the teacher's
/// `CacheObserver`, which serializes `QueryState<V>` to a `String` for the
/// same reason — see `cache_observer.rs`).
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub key: String,
    pub previous_state: Option<serde_json::Value>,
    pub current_state: Option<serde_json::Value>,
    pub is_stale: bool,
    pub is_fetching: bool,
    pub meta: HashMap<String, String>,
}

/// Receives lifecycle events for every query on a [`crate::query_client::QueryClient`]
/// (spec section 4.4/6). A failing observer is logged and does not block the
/// others (spec section 4.4's "observer fan-out").
pub trait Observer: Send + Sync {
    fn on_loading(&self, snapshot: &QuerySnapshot);
    fn on_success(&self, snapshot: &QuerySnapshot);
    fn on_error(&self, snapshot: &QuerySnapshot, error: &QueryCacheError);
    fn on_settled(&self, snapshot: &QuerySnapshot);
}

/// Builds the erased snapshot serde_json::Value for a typed state, falling
/// back to `None` if `V` fails to serialize (never panics: observers must
/// not be able to crash the engine over a bad `Serialize` impl).
pub(crate) fn erase_state<V: serde::Serialize>(state: &QueryState<V>) -> Option<serde_json::Value> {
    match state {
        QueryState::Success(s) if s.has_value => serde_json::to_value(&s.data).ok(),
        _ => None,
    }
}
