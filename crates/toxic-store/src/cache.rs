//! Per-key TTL cache with an optional FIFO bound.
//!
//! [`TtlCache`] keeps a value per key together with the instant it was
//! fetched. An entry is fresh while `now - fetched_at < ttl`; expired
//! entries stay resident so the config store can fall back to them when
//! durable storage is unreadable (see [`TtlCache::get_stale`]).
//!
//! When a maximum entry count is configured, inserting a new key past the
//! bound evicts the oldest-inserted key. Eviction order is insertion order,
//! not access order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

// ── clock ────────────────────────────────────────────────────────────

/// Monotonic time source for cache expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

/// Wall-clock backed [`Clock`] used in production.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven [`Clock`] for deterministic expiry in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Total fresh hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total misses (absent or expired) since creation.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries dropped by the FIFO bound.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Total lookups (hits + misses).
    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate as a value between 0.0 and 1.0 (returns 0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.evictions(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── cache ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    fetched_at: Duration,
}

#[derive(Debug)]
struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Keys in insertion order, oldest first.
    order: VecDeque<K>,
}

/// A TTL cache safe to share between the orchestrator and message handlers.
///
/// All mutation happens inside one short critical section per call, so a
/// reader never observes a half-applied update.
pub struct TtlCache<K, V> {
    name: &'static str,
    ttl: Duration,
    max_entries: Option<usize>,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState<K, V>>,
    stats: CacheStats,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    /// Start building a new cache.
    pub fn builder(name: &'static str) -> TtlCacheBuilder<K, V> {
        TtlCacheBuilder {
            name,
            ttl: Duration::from_secs(60),
            max_entries: None,
            clock: None,
            _marker: PhantomData,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a fresh value. Returns `None` when absent or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let state = self.lock();
        match state.entries.get(key) {
            Some(entry) if now.saturating_sub(entry.fetched_at) < self.ttl => {
                self.stats.record_hit();
                debug!(cache = self.name, ?key, "cache hit");
                Some(entry.value.clone())
            }
            Some(_) => {
                self.stats.record_miss();
                debug!(cache = self.name, ?key, "cache entry expired");
                None
            }
            None => {
                self.stats.record_miss();
                debug!(cache = self.name, ?key, "cache miss");
                None
            }
        }
    }

    /// Return the last value stored under `key`, fresh or not.
    pub fn get_stale(&self, key: &K) -> Option<V> {
        self.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Insert or replace a value, stamping it with the current time.
    ///
    /// Replacing an existing key keeps its position in the eviction order.
    pub fn insert(&self, key: K, value: V) {
        let fetched_at = self.clock.now();
        let mut state = self.lock();
        let entry = CacheEntry { value, fetched_at };
        if state.entries.insert(key.clone(), entry).is_none() {
            state.order.push_back(key.clone());
        }

        if let Some(max) = self.max_entries {
            while state.entries.len() > max {
                let Some(oldest) = state.order.pop_front() else {
                    break;
                };
                state.entries.remove(&oldest);
                self.stats.record_eviction();
                debug!(cache = self.name, key = ?oldest, "cache evicted oldest entry");
            }
        }
        debug!(cache = self.name, ?key, "cache insert");
    }

    /// Remove a specific entry.
    pub fn invalidate(&self, key: &K) {
        let mut state = self.lock();
        if state.entries.remove(key).is_some() {
            state.order.retain(|k| k != key);
        }
        debug!(cache = self.name, ?key, "cache invalidate");
    }

    /// Remove every entry.
    pub fn invalidate_all(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
        debug!(cache = self.name, "cache invalidate_all");
    }

    /// Whether a fresh entry exists for `key`, without touching the stats.
    pub fn contains_fresh(&self, key: &K) -> bool {
        let now = self.clock.now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|e| now.saturating_sub(e.fetched_at) < self.ttl)
    }

    /// Number of resident entries, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl<K, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

// ── builder ──────────────────────────────────────────────────────────

/// Builder for [`TtlCache`].
pub struct TtlCacheBuilder<K, V> {
    name: &'static str,
    ttl: Duration,
    max_entries: Option<usize>,
    clock: Option<Arc<dyn Clock>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> TtlCacheBuilder<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    /// Time-to-live for each entry.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Maximum number of resident entries; oldest-inserted goes first.
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Time source; defaults to a fresh [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the cache.
    pub fn build(self) -> TtlCache<K, V> {
        debug!(
            name = self.name,
            ttl_ms = self.ttl.as_millis() as u64,
            max_entries = ?self.max_entries,
            "ttl cache created"
        );

        TtlCache {
            name: self.name,
            ttl: self.ttl,
            max_entries: self.max_entries,
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(SystemClock::new())),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            stats: CacheStats::default(),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cache(clock: &Arc<ManualClock>) -> TtlCache<String, u32> {
        TtlCache::builder("test")
            .ttl(Duration::from_secs(30))
            .clock(clock.clone())
            .build()
    }

    #[test]
    fn insert_and_get_within_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = make_cache(&clock);

        cache.insert("a".into(), 1);
        clock.advance(Duration::from_millis(29_999));
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn entry_expires_at_ttl_boundary() {
        let clock = Arc::new(ManualClock::new());
        let cache = make_cache(&clock);

        cache.insert("a".into(), 1);
        clock.advance(Duration::from_secs(30));
        assert_eq!(cache.get(&"a".to_string()), None);
        // Still available as a stale fallback.
        assert_eq!(cache.get_stale(&"a".to_string()), Some(1));
    }

    #[test]
    fn reinsert_refreshes_timestamp() {
        let clock = Arc::new(ManualClock::new());
        let cache = make_cache(&clock);

        cache.insert("a".into(), 1);
        clock.advance(Duration::from_secs(20));
        cache.insert("a".into(), 2);
        clock.advance(Duration::from_secs(20));
        assert_eq!(cache.get(&"a".to_string()), Some(2));
    }

    #[test]
    fn invalidate_removes_entry_and_stale_copy() {
        let clock = Arc::new(ManualClock::new());
        let cache = make_cache(&clock);

        cache.insert("a".into(), 1);
        cache.invalidate(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.get_stale(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_all_clears_everything() {
        let clock = Arc::new(ManualClock::new());
        let cache = make_cache(&clock);

        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        cache.invalidate_all();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn bound_evicts_oldest_inserted_not_least_recently_used() {
        let clock = Arc::new(ManualClock::new());
        let cache: TtlCache<u32, u32> = TtlCache::builder("bounded")
            .ttl(Duration::from_secs(60))
            .max_entries(3)
            .clock(clock.clone())
            .build();

        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(3, 30);
        // Reading key 1 must not protect it from eviction.
        assert_eq!(cache.get(&1), Some(10));
        cache.insert(4, 40);

        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&4), Some(40));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[test]
    fn replacing_existing_key_does_not_evict() {
        let clock = Arc::new(ManualClock::new());
        let cache: TtlCache<u32, u32> = TtlCache::builder("bounded")
            .max_entries(2)
            .clock(clock.clone())
            .build();

        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(1, 11);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some(11));
        assert_eq!(cache.get(&2), Some(20));
    }

    #[test]
    fn stats_tracking() {
        let clock = Arc::new(ManualClock::new());
        let cache = make_cache(&clock);
        cache.insert("a".into(), 1);

        let _ = cache.get(&"a".to_string());
        let _ = cache.get(&"nope".to_string());
        let _ = cache.get(&"nope2".to_string());

        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 2);
        assert!((cache.stats().hit_rate() - (1.0 / 3.0)).abs() < 0.01);
    }

    #[test]
    fn stats_display() {
        let stats = CacheStats::default();
        stats.hits.store(50, Ordering::Relaxed);
        stats.misses.store(50, Ordering::Relaxed);
        let display = format!("{stats}");
        assert!(display.contains("hits=50"));
        assert!(display.contains("50.00%"));
    }
}
