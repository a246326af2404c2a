use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::query_cache::QueryCache;

/// Periodic sweep over the whole cache (spec section 4.2), distinct from a
/// single query's per-instance disposal timer (spec section 4.3, handled by
/// [`crate::query::Query`] itself). The teacher instead schedules one
/// one-shot timeout per query (`garbage_collector.rs`); a single interval
/// task scales better once the cache holds many entries, and matches the
/// spec's "periodic sweep" wording directly.
pub struct GarbageCollector {
    handle: tokio::task::JoinHandle<()>,
}

impl GarbageCollector {
    /// Spawns the sweep loop. Dropping the returned handle does not stop it;
    /// call [`GarbageCollector::stop`] (or let `QueryClient::dispose` do so)
    /// to cancel it.
    pub fn spawn(cache: Arc<QueryCache>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so we don't sweep a
            // cache that was just constructed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("running cache garbage collection sweep");
                cache.sweep_expired();
            }
        });
        GarbageCollector { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
