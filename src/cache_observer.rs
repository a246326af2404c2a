/// Cache-level events, distinct from the per-query lifecycle events in
/// [`crate::observer`]: these fire on every `set`/`remove` regardless of
/// whether any subscriber is listening, which is what a persister needs
/// (spec section 6's persistence interface is "consumed, not implemented",
/// driven by exactly this plane). Grounded on the teacher's
/// `CacheObserver`/`CacheEvent`, generalized from a single serialized
/// `String` payload to raw bytes so it can feed
/// [`crate::persistence::PersistenceProvider::persist`] directly.
pub trait CacheObserver: Send + Sync {
    fn process_cache_event(&self, event: CacheEvent);
}

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Created(QueryCachePayload),
    Updated(QueryCachePayload),
    Removed(QueryCacheKey),
}

impl CacheEvent {
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::Created(payload) | CacheEvent::Updated(payload) => payload.key.as_str(),
            CacheEvent::Removed(key) => key.as_str(),
        }
    }
}

/// The serialized form of a cache entry at the moment of the event.
/// `bytes` is `None` when the value failed to serialize (logged, never
/// fatal) or when no persister is registered and the bridge that would
/// populate it was skipped for cost reasons.
#[derive(Debug, Clone)]
pub struct QueryCachePayload {
    pub key: QueryCacheKey,
    pub bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryCacheKey(String);

impl QueryCacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        QueryCacheKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueryCacheKey {
    fn from(key: &str) -> Self {
        QueryCacheKey(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_extracts_from_every_variant() {
        let created = CacheEvent::Created(QueryCachePayload {
            key: QueryCacheKey::new("k"),
            bytes: None,
        });
        let removed = CacheEvent::Removed(QueryCacheKey::new("k"));
        assert_eq!(created.key(), "k");
        assert_eq!(removed.key(), "k");
    }
}
