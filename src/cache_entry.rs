use std::time::Duration;

use crate::instant::Instant;

/// A cached value plus the bookkeeping the eviction policy and staleness
/// checks need (spec section 3).
#[derive(Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub expires_at: Instant,
    pub stale_time: Duration,
    pub cache_time: Duration,
    pub access_count: u64,
    /// False for a placeholder entry inserted before a value is known (the
    /// teacher has no direct equivalent; this lets `QueryCache::set` be
    /// called with a provisional entry without pretending it is
    /// authoritative data).
    pub has_value: bool,
    /// Number of active subscribers; entries with `reference_count > 0` are
    /// pinned and exempt from eviction (spec section 4.2).
    pub reference_count: u32,
    /// Estimated byte footprint, computed once at insertion time (spec
    /// section 4.2). Cached rather than recomputed per eviction scan.
    pub size_bytes: usize,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, stale_time: Duration, cache_time: Duration, size_bytes: usize) -> Self {
        let now = Instant::now();
        CacheEntry {
            data,
            created_at: now,
            last_accessed_at: now,
            expires_at: now.plus(cache_time),
            stale_time,
            cache_time,
            access_count: 0,
            has_value: true,
            reference_count: 0,
            size_bytes,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.created_at.elapsed() < self.stale_time
    }

    pub fn is_stale(&self) -> bool {
        !self.is_fresh()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn touch(&mut self) {
        self.last_accessed_at = Instant::now();
        self.access_count += 1;
    }

    pub fn is_pinned(&self) -> bool {
        self.reference_count > 0
    }
}

/// Estimates the in-memory byte footprint of a value for the purposes of
/// `QueryCache`'s size bound (spec section 4.2). The estimate need not be
/// exact, only monotone and deterministic for equal inputs.
pub trait EstimateSize {
    fn estimate_size(&self) -> usize;
}

macro_rules! impl_estimate_size_for_primitive {
    ($($t:ty),* $(,)?) => {
        $(
            impl EstimateSize for $t {
                fn estimate_size(&self) -> usize {
                    std::mem::size_of::<$t>()
                }
            }
        )*
    };
}

impl_estimate_size_for_primitive!(
    bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64
);

impl EstimateSize for String {
    fn estimate_size(&self) -> usize {
        // Two bytes per UTF-16 code unit, matching spec 4.2's estimator
        // definition rather than the raw UTF-8 byte length.
        self.encode_utf16().count() * 2
    }
}

impl EstimateSize for str {
    fn estimate_size(&self) -> usize {
        self.encode_utf16().count() * 2
    }
}

const COLLECTION_ELEMENT_OVERHEAD: usize = 16;
const OPAQUE_DEFAULT_SIZE: usize = 64;

impl<T: EstimateSize> EstimateSize for Vec<T> {
    fn estimate_size(&self) -> usize {
        self.iter()
            .map(|item| item.estimate_size() + COLLECTION_ELEMENT_OVERHEAD)
            .sum()
    }
}

impl<T: EstimateSize> EstimateSize for Option<T> {
    fn estimate_size(&self) -> usize {
        self.as_ref().map_or(0, EstimateSize::estimate_size)
    }
}

impl<K: EstimateSize, V: EstimateSize> EstimateSize for std::collections::HashMap<K, V> {
    fn estimate_size(&self) -> usize {
        self.iter()
            .map(|(k, v)| k.estimate_size() + v.estimate_size() + COLLECTION_ELEMENT_OVERHEAD)
            .sum()
    }
}

/// Fallback for any value that does not implement [`EstimateSize`]. Used by
/// `QueryCache::set` through the blanket `estimate_opaque` helper so callers
/// are never forced to implement the trait.
pub fn estimate_opaque<T>(_value: &T) -> usize {
    OPAQUE_DEFAULT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_then_stale_with_time() {
        let entry = CacheEntry::new(1u32, Duration::ZERO, Duration::from_secs(60), 4);
        assert!(entry.is_stale());
        assert!(!entry.is_fresh());
    }

    #[test]
    fn fresh_within_stale_time() {
        let entry = CacheEntry::new(1u32, Duration::from_secs(60), Duration::from_secs(120), 4);
        assert!(entry.is_fresh());
        assert!(!entry.is_expired());
    }

    #[test]
    fn string_size_is_two_bytes_per_unit() {
        assert_eq!("hi".to_string().estimate_size(), 4);
    }

    #[test]
    fn size_is_deterministic() {
        let a = vec![1u32, 2, 3].estimate_size();
        let b = vec![1u32, 2, 3].estimate_size();
        assert_eq!(a, b);
    }

    #[test]
    fn touch_increments_access_count() {
        let mut entry = CacheEntry::new("x".to_string(), Duration::from_secs(1), Duration::from_secs(2), 2);
        assert_eq!(entry.access_count, 0);
        entry.touch();
        entry.touch();
        assert_eq!(entry.access_count, 2);
    }
}
