//! Handle cache for open archive readers
//!
//! Holders are keyed by canonical archive path and live in one of two LRU
//! queues. A holder enters the probationary queue when it is created and moves
//! to the protected queue the next time it is checked out. Protected overflow
//! demotes the oldest protected holder back to probation; probationary
//! overflow disposes the oldest probationary holder that nobody has checked
//! out.
//!
//! Every checkout hands out a [`CacheHandle`] that keeps the holder alive and
//! releases it on drop. A holder removed while still checked out is retired:
//! it stays usable by those handles and is disposed when the last one goes.
//! Each holder is disposed exactly once.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::CacheConfig;
use crate::errors::VfsResult;
use crate::fs::utils::FileStamp;
use crate::utils::lock_recovering;

/// Releases the resources of a cached holder
pub trait Dispose {
    fn dispose(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Probationary,
    Protected,
}

struct Slot<V> {
    value: Arc<V>,
    stamp: FileStamp,
    refs: usize,
    generation: u64,
    queue: Queue,
}

struct CacheState<V> {
    slots: HashMap<PathBuf, Slot<V>>,
    /// Removed from the cache while checked out, keyed by generation
    retired: HashMap<u64, Slot<V>>,
    probationary: VecDeque<PathBuf>,
    protected: VecDeque<PathBuf>,
    next_generation: u64,
}

impl<V> CacheState<V> {
    fn queue_mut(&mut self, queue: Queue) -> &mut VecDeque<PathBuf> {
        match queue {
            Queue::Probationary => &mut self.probationary,
            Queue::Protected => &mut self.protected,
        }
    }

    fn unlink(&mut self, key: &Path, queue: Queue) {
        let list = self.queue_mut(queue);
        if let Some(pos) = list.iter().position(|k| k == key) {
            list.remove(pos);
        }
    }

    /// Take `key` out of the cache. Idle holders are returned for disposal,
    /// busy ones are retired.
    fn remove(&mut self, key: &Path, doomed: &mut Vec<Arc<V>>) {
        let Some(slot) = self.slots.remove(key) else {
            return;
        };
        self.unlink(key, slot.queue);
        if slot.refs == 0 {
            doomed.push(slot.value);
        } else {
            self.retired.insert(slot.generation, slot);
        }
    }
}

struct Shared<V> {
    state: Mutex<CacheState<V>>,
    protected_capacity: usize,
    probationary_capacity: usize,
}

impl<V: Dispose> Shared<V> {
    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState<V>> {
        lock_recovering(&self.state, "handle cache")
    }

    /// Rebalance both queues, collecting holders that must be disposed
    fn trim(&self, state: &mut CacheState<V>, doomed: &mut Vec<Arc<V>>) {
        while state.protected.len() > self.protected_capacity {
            let Some(key) = state.protected.pop_front() else {
                break;
            };
            if let Some(slot) = state.slots.get_mut(&key) {
                slot.queue = Queue::Probationary;
            }
            state.probationary.push_back(key);
        }

        while state.probationary.len() > self.probationary_capacity {
            let victim = state
                .probationary
                .iter()
                .find(|key| state.slots.get(*key).is_some_and(|slot| slot.refs == 0))
                .cloned();
            let Some(key) = victim else {
                // Everything on probation is checked out; retry on release
                break;
            };
            log::debug!("evicting {}", key.display());
            state.remove(&key, doomed);
        }
    }

    fn release(&self, key: &Path, generation: u64) {
        let mut doomed = Vec::new();
        {
            let mut state = self.lock();
            let live = state.slots.get(key).is_some_and(|slot| slot.generation == generation);
            if live {
                if let Some(slot) = state.slots.get_mut(key) {
                    slot.refs = slot.refs.saturating_sub(1);
                }
                self.trim(&mut state, &mut doomed);
            } else if let Some(slot) = state.retired.get_mut(&generation) {
                slot.refs = slot.refs.saturating_sub(1);
                if slot.refs == 0
                    && let Some(slot) = state.retired.remove(&generation)
                {
                    doomed.push(slot.value);
                }
            }
        }
        dispose_all(doomed);
    }
}

fn dispose_all<V: Dispose>(doomed: Vec<Arc<V>>) {
    for value in doomed {
        value.dispose();
    }
}

/// Bounded two-queue cache of archive holders
pub struct HandleCache<V: Dispose> {
    shared: Arc<Shared<V>>,
}

impl<V: Dispose> Clone for HandleCache<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: Dispose> HandleCache<V> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState {
                    slots: HashMap::new(),
                    retired: HashMap::new(),
                    probationary: VecDeque::new(),
                    protected: VecDeque::new(),
                    next_generation: 0,
                }),
                protected_capacity: config.protected_capacity.max(1),
                probationary_capacity: config.probationary_capacity.max(1),
            }),
        }
    }

    /// Check out the holder for `key`, creating it with `create` on a miss.
    ///
    /// `create` runs without the cache lock held and returns the holder with
    /// the file stamp it was built from. If another thread inserted the same
    /// key meanwhile, the freshly built holder is disposed and the cached one
    /// is returned.
    pub fn checkout<F>(&self, key: &Path, create: F) -> VfsResult<CacheHandle<V>>
    where
        F: FnOnce() -> VfsResult<(V, FileStamp)>,
    {
        if let Some(handle) = self.try_hit(key) {
            return Ok(handle);
        }

        let (value, stamp) = create()?;
        let value = Arc::new(value);

        let mut doomed = Vec::new();
        let handle = {
            let mut state = self.shared.lock();
            if let Some(slot) = state.slots.get_mut(key) {
                // Lost the race
                slot.refs += 1;
                let handle = self.handle_for(key, slot);
                doomed.push(value);
                handle
            } else {
                let generation = state.next_generation;
                state.next_generation += 1;
                log::debug!("caching holder for {}", key.display());
                let slot = Slot {
                    value,
                    stamp,
                    refs: 1,
                    generation,
                    queue: Queue::Probationary,
                };
                let handle = self.handle_for(key, &slot);
                state.slots.insert(key.to_path_buf(), slot);
                state.probationary.push_back(key.to_path_buf());
                self.shared.trim(&mut state, &mut doomed);
                handle
            }
        };
        dispose_all(doomed);
        Ok(handle)
    }

    fn try_hit(&self, key: &Path) -> Option<CacheHandle<V>> {
        let mut doomed = Vec::new();
        let handle = {
            let mut state = self.shared.lock();
            let queue = state.slots.get(key)?.queue;
            state.unlink(key, queue);
            state.protected.push_back(key.to_path_buf());
            let slot = state.slots.get_mut(key)?;
            slot.queue = Queue::Protected;
            slot.refs += 1;
            let handle = self.handle_for(key, slot);
            self.shared.trim(&mut state, &mut doomed);
            handle
        };
        dispose_all(doomed);
        Some(handle)
    }

    fn handle_for(&self, key: &Path, slot: &Slot<V>) -> CacheHandle<V> {
        CacheHandle {
            shared: Arc::clone(&self.shared),
            key: key.to_path_buf(),
            generation: slot.generation,
            stamp: slot.stamp,
            value: Arc::clone(&slot.value),
        }
    }

    /// Force `key` out of the cache. Outstanding handles keep working on the
    /// old holder, which is disposed once they are all released.
    pub fn invalidate(&self, key: &Path) {
        let mut doomed = Vec::new();
        {
            let mut state = self.shared.lock();
            state.remove(key, &mut doomed);
        }
        dispose_all(doomed);
    }

    /// Force out the holder `handle` was checked out from, unless it has
    /// already been replaced. A rebuilt holder for the same key stays cached.
    pub fn invalidate_handle(&self, handle: &CacheHandle<V>) {
        let mut doomed = Vec::new();
        {
            let mut state = self.shared.lock();
            let current = state
                .slots
                .get(&handle.key)
                .is_some_and(|slot| slot.generation == handle.generation);
            if current {
                state.remove(&handle.key, &mut doomed);
            }
        }
        dispose_all(doomed);
    }

    /// Drop every holder
    pub fn clear(&self) {
        let mut doomed = Vec::new();
        {
            let mut state = self.shared.lock();
            let keys: Vec<PathBuf> = state.slots.keys().cloned().collect();
            for key in keys {
                state.remove(&key, &mut doomed);
            }
        }
        dispose_all(doomed);
    }

    /// Number of cached holders, retired ones excluded
    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &Path) -> bool {
        self.shared.lock().slots.contains_key(key)
    }
}

/// A checked-out holder. Released when dropped.
pub struct CacheHandle<V: Dispose> {
    shared: Arc<Shared<V>>,
    key: PathBuf,
    generation: u64,
    stamp: FileStamp,
    value: Arc<V>,
}

impl<V: Dispose> CacheHandle<V> {
    /// File stamp recorded when the holder was built
    pub fn stamp(&self) -> FileStamp {
        self.stamp
    }

    #[cfg(test)]
    pub(crate) fn shared_value(&self) -> Arc<V> {
        Arc::clone(&self.value)
    }
}

impl<V: Dispose> Deref for CacheHandle<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<V: Dispose> Drop for CacheHandle<V> {
    fn drop(&mut self) {
        self.shared.release(&self.key, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted {
        id: usize,
        disposed: Arc<AtomicUsize>,
    }

    impl Dispose for Counted {
        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cache(protected: usize, probationary: usize) -> HandleCache<Counted> {
        HandleCache::new(&CacheConfig {
            protected_capacity: protected,
            probationary_capacity: probationary,
        })
    }

    fn stamp(n: u64) -> FileStamp {
        FileStamp { modified: 1000, length: n }
    }

    fn counted(id: usize, counter: &Arc<AtomicUsize>) -> VfsResult<(Counted, FileStamp)> {
        Ok((
            Counted {
                id,
                disposed: Arc::clone(counter),
            },
            stamp(id as u64),
        ))
    }

    #[test]
    fn test_hit_reuses_holder() {
        let cache = cache(2, 2);
        let disposed = Arc::new(AtomicUsize::new(0));
        let first = cache.checkout(Path::new("/a"), || counted(1, &disposed)).unwrap();
        drop(first);
        let second = cache.checkout(Path::new("/a"), || counted(2, &disposed)).unwrap();
        assert_eq!(second.id, 1);
        assert_eq!(second.stamp(), stamp(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_idle_probationary_holder_is_evicted() {
        let cache = cache(2, 2);
        let disposed = Arc::new(AtomicUsize::new(0));
        for (i, key) in ["/a", "/b", "/c"].iter().enumerate() {
            drop(cache.checkout(Path::new(key), || counted(i, &disposed)).unwrap());
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(Path::new("/a")));
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_protected_holder_survives_probation_churn() {
        let cache = cache(2, 1);
        let disposed = Arc::new(AtomicUsize::new(0));
        drop(cache.checkout(Path::new("/hot"), || counted(0, &disposed)).unwrap());
        // Second access promotes
        drop(cache.checkout(Path::new("/hot"), || counted(0, &disposed)).unwrap());
        for i in 1..5 {
            let key = format!("/cold{}", i);
            drop(cache.checkout(Path::new(&key), || counted(i, &disposed)).unwrap());
        }
        assert!(cache.contains(Path::new("/hot")));
        assert_eq!(cache.len(), 2);
        assert_eq!(disposed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_checked_out_holder_is_not_evicted() {
        let cache = cache(1, 1);
        let disposed = Arc::new(AtomicUsize::new(0));
        let held = cache.checkout(Path::new("/a"), || counted(1, &disposed)).unwrap();
        drop(cache.checkout(Path::new("/b"), || counted(2, &disposed)).unwrap());
        assert!(cache.contains(Path::new("/a")));
        assert!(!cache.contains(Path::new("/b")));
        drop(held);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_disposes_once_after_last_release() {
        let cache = cache(2, 2);
        let disposed = Arc::new(AtomicUsize::new(0));
        let a = cache.checkout(Path::new("/a"), || counted(1, &disposed)).unwrap();
        let b = cache.checkout(Path::new("/a"), || counted(9, &disposed)).unwrap();
        cache.invalidate(Path::new("/a"));
        assert!(!cache.contains(Path::new("/a")));
        assert_eq!(disposed.load(Ordering::SeqCst), 0);

        // Replacement holder under the same key is independent
        let fresh = cache.checkout(Path::new("/a"), || counted(2, &disposed)).unwrap();
        assert_eq!(fresh.id, 2);

        drop(a);
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        drop(fresh);
        cache.invalidate(Path::new("/a"));
        cache.invalidate(Path::new("/a"));
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stale_handle_does_not_evict_rebuilt_holder() {
        let cache = cache(2, 2);
        let disposed = Arc::new(AtomicUsize::new(0));
        let stale = cache.checkout(Path::new("/a"), || counted(1, &disposed)).unwrap();

        // Another caller notices the change first and rebuilds
        cache.invalidate_handle(&stale);
        let rebuilt = cache.checkout(Path::new("/a"), || counted(2, &disposed)).unwrap();
        assert_eq!(rebuilt.id, 2);

        cache.invalidate_handle(&stale);
        assert!(cache.contains(Path::new("/a")));
        drop(stale);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);

        let again = cache.checkout(Path::new("/a"), || counted(3, &disposed)).unwrap();
        assert_eq!(again.id, 2);
    }

    #[test]
    fn test_clear_disposes_idle_holders() {
        let cache = cache(4, 4);
        let disposed = Arc::new(AtomicUsize::new(0));
        drop(cache.checkout(Path::new("/a"), || counted(1, &disposed)).unwrap());
        let busy = cache.checkout(Path::new("/b"), || counted(2, &disposed)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        drop(busy);
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_create_caches_nothing() {
        let cache = cache(2, 2);
        let result = cache.checkout(Path::new("/a"), || Err(crate::errors::VfsError::NotFound("/a".into())));
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_checkouts_share_one_holder() {
        let cache = cache(4, 4);
        let disposed = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let disposed = Arc::clone(&disposed);
                let created = Arc::clone(&created);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let handle = cache
                            .checkout(Path::new("/shared"), || {
                                created.fetch_add(1, Ordering::SeqCst);
                                counted(7, &disposed)
                            })
                            .unwrap();
                        assert_eq!(handle.id, 7);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(cache.len(), 1);
        // Holders built by race losers are disposed, the cached one is not
        assert_eq!(disposed.load(Ordering::SeqCst), created.load(Ordering::SeqCst) - 1);
    }
}
