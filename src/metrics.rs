use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::instant::Instant;

/// Hit/miss/eviction/latency aggregation for a [`crate::query_cache::QueryCache`]
/// (spec section 4.2). Guarded by its own mutex so it can be updated from
/// `get`/`set`/eviction without taking the cache's main lock.
#[derive(Default)]
pub struct CacheMetrics {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    hits: u64,
    misses: u64,
    evictions: u64,
    total_fetches: u64,
    total_lookups: u64,
    peak_bytes: usize,
    current_bytes: usize,
    /// Bounded ring buffer of `(completed_at, duration)` fetch samples,
    /// capacity >= 100 per spec section 3. The timestamp doubles as the
    /// source data for `throughput_window` snapshots (spec section 2/4.4).
    latencies: VecDeque<(Instant, Duration)>,
}

const LATENCY_RING_CAPACITY: usize = 256;

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.hits += 1;
        inner.total_lookups += 1;
    }

    pub fn record_miss(&self) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.misses += 1;
        inner.total_lookups += 1;
    }

    pub fn record_eviction(&self, freed_bytes: usize) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.evictions += 1;
        inner.current_bytes = inner.current_bytes.saturating_sub(freed_bytes);
    }

    pub fn record_insert(&self, size_bytes: usize) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.current_bytes += size_bytes;
        inner.peak_bytes = inner.peak_bytes.max(inner.current_bytes);
    }

    pub fn record_removal(&self, size_bytes: usize) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.current_bytes = inner.current_bytes.saturating_sub(size_bytes);
    }

    pub fn record_fetch_latency(&self, duration: Duration) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.total_fetches += 1;
        if inner.latencies.len() == LATENCY_RING_CAPACITY {
            inner.latencies.pop_front();
        }
        inner.latencies.push_back((Instant::now(), duration));
    }

    /// `subscriptions` has no source data inside `CacheMetrics` itself (it is
    /// a property of live cache entries, not of the metrics ring), so callers
    /// that need it populate it over the returned value — see
    /// `QueryCache::info`.
    pub fn info(&self) -> CacheInfo {
        let inner = self.inner.lock().expect("metrics poisoned");
        let durations: VecDeque<Duration> = inner.latencies.iter().map(|(_, d)| *d).collect();
        let (avg, p95) = latency_percentiles(&durations);
        CacheInfo {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            total_fetches: inner.total_fetches,
            total_lookups: inner.total_lookups,
            current_bytes: inner.current_bytes,
            peak_bytes: inner.peak_bytes,
            subscriptions: 0,
            avg_fetch_latency: avg,
            p95_fetch_latency: p95,
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let inner = self.inner.lock().expect("metrics poisoned");
        if inner.total_lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / inner.total_lookups as f64
        }
    }

    /// Fetch throughput over the trailing `window` (spec section 2's
    /// "throughput windows" and section 4.4's `get_metrics(throughput_window?)`).
    /// Only ring samples newer than `window` are counted, so the result
    /// reflects recent activity even though the ring itself spans a longer
    /// history.
    pub fn throughput(&self, window: Duration) -> ThroughputSnapshot {
        let inner = self.inner.lock().expect("metrics poisoned");
        let fetches_in_window = inner
            .latencies
            .iter()
            .filter(|(completed_at, _)| completed_at.elapsed() <= window)
            .count() as u64;
        let fetches_per_second = if window.is_zero() {
            0.0
        } else {
            fetches_in_window as f64 / window.as_secs_f64()
        };
        ThroughputSnapshot {
            window,
            fetches_in_window,
            fetches_per_second,
        }
    }
}

fn latency_percentiles(samples: &VecDeque<Duration>) -> (Duration, Duration) {
    if samples.is_empty() {
        return (Duration::ZERO, Duration::ZERO);
    }
    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
    sorted.sort();
    let sum: Duration = sorted.iter().sum();
    let avg = sum / sorted.len() as u32;
    let p95_index = ((sorted.len() as f64) * 0.95).ceil() as usize;
    let p95_index = p95_index.saturating_sub(1).min(sorted.len() - 1);
    (avg, sorted[p95_index])
}

/// A point-in-time snapshot of [`CacheMetrics`] (spec section 4.2's
/// `info()`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheInfo {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_fetches: u64,
    pub total_lookups: u64,
    pub current_bytes: usize,
    pub peak_bytes: usize,
    /// Active subscriber count, summed across all live entries (spec
    /// section 6). `CacheMetrics` has no entry-level view, so `QueryCache::info`
    /// fills this in after calling `CacheMetrics::info`.
    pub subscriptions: usize,
    pub avg_fetch_latency: Duration,
    pub p95_fetch_latency: Duration,
}

/// Fetch throughput over a trailing window (spec section 2/4.4).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ThroughputSnapshot {
    pub window: Duration,
    pub fetches_in_window: u64,
    pub fetches_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_is_zero_with_no_lookups() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_tracks_hits_over_lookups() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        assert!((metrics.hit_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn peak_bytes_is_sticky() {
        let metrics = CacheMetrics::new();
        metrics.record_insert(100);
        metrics.record_removal(60);
        metrics.record_insert(10);
        let info = metrics.info();
        assert_eq!(info.current_bytes, 50);
        assert_eq!(info.peak_bytes, 100);
    }

    #[test]
    fn latency_ring_is_bounded() {
        let metrics = CacheMetrics::new();
        for i in 0..(LATENCY_RING_CAPACITY + 50) {
            metrics.record_fetch_latency(Duration::from_millis(i as u64));
        }
        let info = metrics.info();
        assert_eq!(info.total_fetches, (LATENCY_RING_CAPACITY + 50) as u64);
        // p95 should reflect only the retained, most recent samples.
        assert!(info.p95_fetch_latency >= Duration::from_millis(50));
    }

    #[test]
    fn eviction_reduces_current_bytes() {
        let metrics = CacheMetrics::new();
        metrics.record_insert(200);
        metrics.record_eviction(50);
        assert_eq!(metrics.info().current_bytes, 150);
        assert_eq!(metrics.info().evictions, 1);
    }

    #[test]
    fn throughput_counts_only_samples_within_the_window() {
        let metrics = CacheMetrics::new();
        metrics.record_fetch_latency(Duration::from_millis(1));
        metrics.record_fetch_latency(Duration::from_millis(2));
        std::thread::sleep(Duration::from_millis(30));
        metrics.record_fetch_latency(Duration::from_millis(3));

        let snapshot = metrics.throughput(Duration::from_millis(10));
        assert_eq!(snapshot.fetches_in_window, 1, "only the most recent sample falls inside a 10ms window");
        assert!(snapshot.fetches_per_second > 0.0);

        let snapshot = metrics.throughput(Duration::from_secs(60));
        assert_eq!(snapshot.fetches_in_window, 3, "a wide window must see every retained sample");
    }

    #[test]
    fn info_defaults_subscriptions_to_zero() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.info().subscriptions, 0);
    }
}
