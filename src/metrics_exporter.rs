use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::instant::Instant;
use crate::metrics::{CacheInfo, ThroughputSnapshot};

/// Per-query metrics carried inside a [`PerformanceSnapshot`] (spec
/// section 6). Distinct from [`CacheInfo`], which aggregates across the
/// whole cache.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct QueryMetricsSnapshot {
    pub fetch_count: u64,
    pub average_fetch_duration: Duration,
    pub max_fetch_duration: Duration,
    pub last_fetch_duration: Option<Duration>,
    pub fetch_history: Vec<Duration>,
    pub reference_count: u32,
}

/// A point-in-time export of the whole client (spec section 6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: Instant,
    pub total_queries: usize,
    pub active_queries: usize,
    pub memory_bytes: usize,
    pub cache: CacheInfo,
    pub per_query: HashMap<String, QueryMetricsSnapshot>,
    /// Present when the caller asked `get_metrics` for a `throughput_window`
    /// (spec section 2/4.4); `None` otherwise rather than a window of zero.
    pub throughput: Option<ThroughputSnapshot>,
}

/// An observer specialized for metrics delivery. Exporters are ordinary
/// [`crate::observer::Observer`]s whose `configure` controls delivery cadence
/// and destination (spec section 6); `export` is called by the client on
/// whatever cadence the host application schedules (the engine does not
/// impose one).
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    async fn export(&self, snapshot: PerformanceSnapshot) -> Result<(), ExportError>;
    fn configure(&mut self, config: HashMap<String, String>);
}

#[derive(Debug, thiserror::Error)]
#[error("metrics export failed: {0}")]
pub struct ExportError(pub String);
