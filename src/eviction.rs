use crate::instant::Instant;

/// What an eviction policy needs to know about a candidate entry, without
/// exposing the cache's erased value storage to the policy (spec section
/// 4.2's "policies select victims from entries with reference_count == 0").
#[derive(Debug, Clone, Copy)]
pub struct EvictionCandidate<'a> {
    pub key: &'a str,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub reference_count: u32,
}

/// Selects which entries to evict when the cache exceeds its bounds.
///
/// This mirrors the teacher's pattern of small, swappable strategy traits
/// (`CacheObserver`, `QueryPersister`) rather than baking a single policy
/// into `QueryCache`.
pub trait EvictionPolicy: Send + Sync {
    /// Returns keys to evict, in the order they should be removed, drawn
    /// only from `candidates` (which the cache has already filtered to
    /// `reference_count == 0`). The cache stops once enough entries have
    /// been removed to satisfy its bounds; the policy need not account for
    /// sizes itself.
    fn select_victims<'a>(&self, candidates: &[EvictionCandidate<'a>]) -> Vec<&'a str>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Lru;

impl EvictionPolicy for Lru {
    fn select_victims<'a>(&self, candidates: &[EvictionCandidate<'a>]) -> Vec<&'a str> {
        let mut sorted: Vec<_> = candidates.to_vec();
        sorted.sort_by_key(|c| c.last_accessed_at);
        sorted.into_iter().map(|c| c.key).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Lfu;

impl EvictionPolicy for Lfu {
    fn select_victims<'a>(&self, candidates: &[EvictionCandidate<'a>]) -> Vec<&'a str> {
        let mut sorted: Vec<_> = candidates.to_vec();
        sorted.sort_by(|a, b| {
            a.access_count
                .cmp(&b.access_count)
                .then(a.last_accessed_at.cmp(&b.last_accessed_at))
        });
        sorted.into_iter().map(|c| c.key).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Fifo;

impl EvictionPolicy for Fifo {
    fn select_victims<'a>(&self, candidates: &[EvictionCandidate<'a>]) -> Vec<&'a str> {
        let mut sorted: Vec<_> = candidates.to_vec();
        sorted.sort_by_key(|c| c.created_at);
        sorted.into_iter().map(|c| c.key).collect()
    }
}

/// The three built-in policies named in spec section 4.2, selectable from
/// `QueryCacheOptions` without the caller needing a trait object.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub enum EvictionPolicyKind {
    #[default]
    Lru,
    Lfu,
    Fifo,
}

impl EvictionPolicyKind {
    pub fn policy(self) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionPolicyKind::Lru => Box::new(Lru),
            EvictionPolicyKind::Lfu => Box::new(Lfu),
            EvictionPolicyKind::Fifo => Box::new(Fifo),
        }
    }
}
