//! Generation-based Block Caches
//!
//! Decoded blocks (token blocks, LID blocks, MID/RID/param blocks, the token
//! table, registries) are cached per fraction in byte-bounded caches that
//! share one process-wide [`CacheMaintainer`].
//!
//! ## Miss path
//!
//! The first caller for a key inserts a pending marker, releases the lock,
//! computes the value, then publishes it; concurrent callers for the same key
//! block on a condvar until the value (or the error) lands. A failed fill
//! removes the marker so waiters re-attempt the load themselves.
//!
//! ## Eviction
//!
//! Eviction is generation-based rather than strict LRU: the maintainer
//! advances a shared generation counter every `cache_gc_delay`, entries are
//! stamped with the generation of their last access, and when the total size
//! across all registered caches exceeds the cap, whole oldest generations are
//! dropped first until the total falls below the cap.
//!
//! A fraction releases its caches on suicide via [`Cache::release`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use seqdb_core::Result;

/// Process-wide cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub waits: AtomicU64,
    pub reattempts: AtomicU64,
    pub evicted_bytes: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

trait Shrinkable: Send + Sync {
    /// Drop entries whose last-access generation is <= `generation`; returns
    /// bytes freed.
    fn evict_up_to(&self, generation: u64) -> u64;

    /// Oldest last-access generation present, if any entry exists.
    fn oldest_generation(&self) -> Option<u64>;
}

/// Owns the generation counter, the global size budget, and the registry of
/// caches to shrink.
pub struct CacheMaintainer {
    size_limit: u64,
    generation: AtomicU64,
    total_size: AtomicU64,
    caches: Mutex<Vec<Weak<dyn Shrinkable>>>,
    stats: Arc<CacheStats>,
}

impl CacheMaintainer {
    pub fn new(size_limit: u64) -> Arc<Self> {
        Arc::new(CacheMaintainer {
            size_limit,
            generation: AtomicU64::new(1),
            total_size: AtomicU64::new(0),
            caches: Mutex::new(Vec::new()),
            stats: Arc::new(CacheStats::default()),
        })
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Create a cache registered with this maintainer.
    pub fn new_cache<T: Clone + Send + 'static>(self: &Arc<Self>) -> Cache<T> {
        let inner = Arc::new(CacheInner {
            map: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            maintainer: self.clone(),
        });
        self.caches
            .lock()
            .unwrap()
            .push(Arc::downgrade(&inner) as Weak<dyn Shrinkable>);
        Cache { inner }
    }

    /// One maintenance pass: advance the generation, then evict oldest
    /// generations while the total size exceeds the cap. Returns bytes freed.
    pub fn maintain(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed);

        let mut freed = 0u64;
        loop {
            if self.total_size.load(Ordering::Relaxed) <= self.size_limit {
                break;
            }

            let caches = self.collect_live();
            let oldest = caches
                .iter()
                .filter_map(|c| c.oldest_generation())
                .min();
            let Some(oldest) = oldest else { break };

            let mut round = 0u64;
            for cache in &caches {
                round += cache.evict_up_to(oldest);
            }
            if round == 0 {
                break;
            }
            self.total_size.fetch_sub(round, Ordering::Relaxed);
            self.stats.evicted_bytes.fetch_add(round, Ordering::Relaxed);
            freed += round;
        }

        if freed > 0 {
            tracing::debug!(
                freed,
                total = self.total_size.load(Ordering::Relaxed),
                limit = self.size_limit,
                "cache eviction pass"
            );
        }
        freed
    }

    fn collect_live(&self) -> Vec<Arc<dyn Shrinkable>> {
        let mut caches = self.caches.lock().unwrap();
        caches.retain(|w| w.strong_count() > 0);
        caches.iter().filter_map(Weak::upgrade).collect()
    }

    fn add_size(&self, size: u64) {
        self.total_size.fetch_add(size, Ordering::Relaxed);
    }

    fn sub_size(&self, size: u64) {
        self.total_size.fetch_sub(size, Ordering::Relaxed);
    }
}

enum Entry<T> {
    /// A fill is in flight; waiters block on the condvar.
    Pending,
    Ready {
        value: T,
        size: u64,
        generation: u64,
    },
}

struct CacheInner<T> {
    map: Mutex<HashMap<u32, Entry<T>>>,
    cond: Condvar,
    maintainer: Arc<CacheMaintainer>,
}

impl<T: Clone + Send + 'static> Shrinkable for CacheInner<T> {
    fn evict_up_to(&self, generation: u64) -> u64 {
        let mut map = self.map.lock().unwrap();
        let mut freed = 0;
        map.retain(|_, entry| match entry {
            Entry::Pending => true,
            Entry::Ready {
                size, generation: g, ..
            } => {
                if *g <= generation {
                    freed += *size;
                    false
                } else {
                    true
                }
            }
        });
        freed
    }

    fn oldest_generation(&self) -> Option<u64> {
        let map = self.map.lock().unwrap();
        map.values()
            .filter_map(|e| match e {
                Entry::Ready { generation, .. } => Some(*generation),
                Entry::Pending => None,
            })
            .min()
    }
}

/// A byte-bounded cache of decoded blocks, keyed by block index.
pub struct Cache<T: Clone + Send + 'static> {
    inner: Arc<CacheInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Cache {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Cache<T> {
    /// Get the value for `key`, filling it with `fill` on a miss. `fill`
    /// returns the value and its size in bytes.
    pub fn get_with<F>(&self, key: u32, fill: F) -> Result<T>
    where
        F: FnOnce() -> Result<(T, u64)>,
    {
        let stats = self.inner.maintainer.stats.clone();
        let generation = self.inner.maintainer.generation();

        {
            let mut map = self.inner.map.lock().unwrap();
            loop {
                match map.get_mut(&key) {
                    Some(Entry::Ready {
                        value, generation: g, ..
                    }) => {
                        *g = generation;
                        stats.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(value.clone());
                    }
                    Some(Entry::Pending) => {
                        stats.waits.fetch_add(1, Ordering::Relaxed);
                        map = self.inner.cond.wait(map).unwrap();
                        // the filler may have failed and removed the entry;
                        // loop and re-check
                        if !map.contains_key(&key) {
                            stats.reattempts.fetch_add(1, Ordering::Relaxed);
                            map.insert(key, Entry::Pending);
                            break;
                        }
                    }
                    None => {
                        map.insert(key, Entry::Pending);
                        break;
                    }
                }
            }
        }

        stats.misses.fetch_add(1, Ordering::Relaxed);
        let filled = fill();

        let mut map = self.inner.map.lock().unwrap();
        match filled {
            Ok((value, size)) => {
                map.insert(
                    key,
                    Entry::Ready {
                        value: value.clone(),
                        size,
                        generation,
                    },
                );
                self.inner.maintainer.add_size(size);
                self.inner.cond.notify_all();
                Ok(value)
            }
            Err(e) => {
                map.remove(&key);
                self.inner.cond.notify_all();
                Err(e)
            }
        }
    }

    /// Peek without filling.
    pub fn get(&self, key: u32) -> Option<T> {
        let map = self.inner.map.lock().unwrap();
        match map.get(&key) {
            Some(Entry::Ready { value, .. }) => Some(value.clone()),
            _ => None,
        }
    }

    /// Seed a value without going through the miss path (used when sealing
    /// hands its freshly-built token table to the new sealed fraction).
    pub fn put(&self, key: u32, value: T, size: u64) {
        let mut map = self.inner.map.lock().unwrap();
        let generation = self.inner.maintainer.generation();
        if let Some(Entry::Ready { size: old, .. }) = map.insert(
            key,
            Entry::Ready {
                value,
                size,
                generation,
            },
        ) {
            self.inner.maintainer.sub_size(old);
        }
        self.inner.maintainer.add_size(size);
    }

    /// Drop every entry; called when the owning fraction is destroyed.
    pub fn release(&self) {
        let mut map = self.inner.map.lock().unwrap();
        let mut freed = 0;
        for entry in map.values() {
            if let Entry::Ready { size, .. } = entry {
                freed += size;
            }
        }
        map.clear();
        self.inner.cond.notify_all();
        self.inner.maintainer.sub_size(freed);
    }

    pub fn len(&self) -> usize {
        self.inner.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_miss_then_hit() {
        let maintainer = CacheMaintainer::new(1024);
        let cache: Cache<Arc<Vec<u8>>> = maintainer.new_cache();

        let calls = AtomicUsize::new(0);
        let fill = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok((Arc::new(vec![1u8, 2, 3]), 3))
        };

        let a = cache.get_with(7, fill).unwrap();
        assert_eq!(*a, vec![1, 2, 3]);
        let b = cache.get_with(7, || panic!("must not refill")).unwrap();
        assert_eq!(*b, vec![1, 2, 3]);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(maintainer.stats().misses(), 1);
        assert_eq!(maintainer.stats().hits(), 1);
        assert_eq!(maintainer.total_size(), 3);
    }

    #[test]
    fn test_fill_error_not_cached() {
        let maintainer = CacheMaintainer::new(1024);
        let cache: Cache<Arc<Vec<u8>>> = maintainer.new_cache();

        let err = cache.get_with(1, || {
            Err::<(Arc<Vec<u8>>, u64), _>(seqdb_core::Error::corrupted("bad block"))
        });
        assert!(err.is_err());

        // next call retries the fill
        let ok = cache.get_with(1, || Ok((Arc::new(vec![9u8]), 1))).unwrap();
        assert_eq!(*ok, vec![9]);
    }

    #[test]
    fn test_eviction_when_over_cap() {
        let maintainer = CacheMaintainer::new(10);
        let cache: Cache<Arc<Vec<u8>>> = maintainer.new_cache();

        cache.get_with(1, || Ok((Arc::new(vec![0u8; 6]), 6))).unwrap();
        maintainer.maintain(); // generation bump; entry 1 now older

        cache.get_with(2, || Ok((Arc::new(vec![0u8; 6]), 6))).unwrap();
        assert_eq!(maintainer.total_size(), 12);

        let freed = maintainer.maintain();
        assert!(freed >= 6);
        assert!(maintainer.total_size() <= 10);

        // entry 1 was in the oldest generation, so it went first
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());

        // evicted entries miss again
        let misses_before = maintainer.stats().misses();
        cache.get_with(1, || Ok((Arc::new(vec![0u8; 2]), 2))).unwrap();
        assert_eq!(maintainer.stats().misses(), misses_before + 1);
    }

    #[test]
    fn test_access_refreshes_generation() {
        let maintainer = CacheMaintainer::new(8);
        let cache: Cache<Arc<Vec<u8>>> = maintainer.new_cache();

        cache.get_with(1, || Ok((Arc::new(vec![0u8; 5]), 5))).unwrap();
        maintainer.maintain();

        // touch entry 1 in the new generation, then add an overflowing entry
        cache.get_with(1, || unreachable!()).unwrap();
        cache.get_with(2, || Ok((Arc::new(vec![0u8; 5]), 5))).unwrap();

        maintainer.maintain();
        // both entries share the newest generations; eviction starts from the
        // oldest and stops as soon as the cap is met
        assert!(maintainer.total_size() <= 8);
    }

    #[test]
    fn test_release_frees_all() {
        let maintainer = CacheMaintainer::new(1024);
        let cache: Cache<Arc<Vec<u8>>> = maintainer.new_cache();

        cache.get_with(1, || Ok((Arc::new(vec![0u8; 10]), 10))).unwrap();
        cache.get_with(2, || Ok((Arc::new(vec![0u8; 20]), 20))).unwrap();
        assert_eq!(maintainer.total_size(), 30);

        cache.release();
        assert_eq!(maintainer.total_size(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_fill_single_flight() {
        let maintainer = CacheMaintainer::new(1 << 20);
        let cache: Cache<Arc<Vec<u8>>> = maintainer.new_cache();
        let fills = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fills = fills.clone();
            handles.push(std::thread::spawn(move || {
                cache
                    .get_with(42, || {
                        fills.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        Ok((Arc::new(vec![7u8; 100]), 100))
                    })
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(*handle.join().unwrap(), vec![7u8; 100]);
        }
        assert_eq!(fills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_put_seeds_entry() {
        let maintainer = CacheMaintainer::new(1024);
        let cache: Cache<Arc<&'static str>> = maintainer.new_cache();

        cache.put(0, Arc::new("token table"), 64);
        assert_eq!(*cache.get(0).unwrap(), "token table");
        assert_eq!(maintainer.total_size(), 64);
    }
}
