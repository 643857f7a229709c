// ConvStream - app/cache.rs
//
// TTL + LRU memoisation of expensive computations with single-flight per key.
//
// - `get_or_compute` returns a live entry, or makes the calling thread the
//   "leader" for that key: it inserts a pending slot, computes outside the
//   lock, stores the value, and wakes every caller that queued behind it.
// - Failures are handed to all waiting callers and never stored.
// - A leader that panics drops its guard, which removes the pending slot and
//   releases waiters with `CacheError::Abandoned`.
// - Capacity is enforced by evicting the least recently used ready entry;
//   expired entries are dropped on access and by `purge_expired`.

use crate::util::error::CacheError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// =============================================================================
// Slots
// =============================================================================

/// Shared between the leader and the callers waiting on it.
#[derive(Debug)]
struct InFlight<V> {
    result: Mutex<Option<Result<V, CacheError>>>,
    done: Condvar,
}

impl<V: Clone> InFlight<V> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn finish(&self, result: Result<V, CacheError>) {
        let mut slot = self.result.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(result);
        }
        drop(slot);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<V, CacheError> {
        let mut slot = self.result.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = match self.done.wait(slot) {
                Ok(guard) => guard,
                Err(p) => p.into_inner(),
            };
        }
    }
}

#[derive(Debug)]
enum Slot<V> {
    Ready {
        value: V,
        expires_at: Instant,
        last_used: u64,
    },
    Pending(Arc<InFlight<V>>),
}

#[derive(Debug)]
struct Inner<K, V> {
    slots: HashMap<K, Slot<V>>,
    /// Logical clock for LRU ordering.
    tick: u64,
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Ready entries currently held.
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Callers that waited on another caller's computation.
    pub coalesced: u64,
    /// Entries removed to respect capacity.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
}

// =============================================================================
// TtlCache
// =============================================================================

#[derive(Debug)]
pub struct TtlCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Releases waiters if the leader unwinds before finishing.
struct LeaderGuard<'a, K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    cache: &'a TtlCache<K, V>,
    key: Option<K>,
    flight: Arc<InFlight<V>>,
}

impl<K, V> Drop for LeaderGuard<'_, K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            tracing::warn!(key = %key, "Cached computation abandoned");
            self.cache.remove_pending(&key, &self.flight);
            self.flight.finish(Err(CacheError::Abandoned {
                key: key.to_string(),
            }));
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cached value for `key` if present and unexpired; otherwise run
    /// `compute` (once across all concurrent callers) and cache its value for
    /// `ttl`.
    pub fn get_or_compute<F, E>(&self, key: K, ttl: Duration, compute: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Result<V, E>,
        E: Display,
    {
        let flight = {
            let mut inner = self.lock();
            inner.tick += 1;
            let tick = inner.tick;
            let now = Instant::now();

            let mut expired = false;
            match inner.slots.get_mut(&key) {
                Some(Slot::Ready {
                    value,
                    expires_at,
                    last_used,
                }) => {
                    if *expires_at > now {
                        *last_used = tick;
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(value.clone());
                    }
                    expired = true;
                }
                Some(Slot::Pending(flight)) => {
                    let flight = Arc::clone(flight);
                    drop(inner);
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    return flight.wait();
                }
                None => {}
            }
            if expired {
                inner.slots.remove(&key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            let flight = Arc::new(InFlight::new());
            inner
                .slots
                .insert(key.clone(), Slot::Pending(Arc::clone(&flight)));
            flight
        };

        let mut guard = LeaderGuard {
            cache: self,
            key: Some(key.clone()),
            flight: Arc::clone(&flight),
        };

        let result = compute().map_err(|e| CacheError::ComputeFailed {
            key: key.to_string(),
            reason: e.to_string(),
        });

        // Completed normally; the guard has nothing left to clean up.
        guard.key = None;
        drop(guard);

        {
            let mut inner = self.lock();
            match &result {
                Ok(value) => {
                    inner.tick += 1;
                    let last_used = inner.tick;
                    inner.slots.insert(
                        key.clone(),
                        Slot::Ready {
                            value: value.clone(),
                            expires_at: Instant::now() + ttl,
                            last_used,
                        },
                    );
                    self.evict_lru(&mut inner);
                }
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Cached computation failed");
                    inner.slots.remove(&key);
                }
            }
        }

        flight.finish(result.clone());
        result
    }

    fn remove_pending(&self, key: &K, flight: &Arc<InFlight<V>>) {
        let mut inner = self.lock();
        if let Some(Slot::Pending(current)) = inner.slots.get(key) {
            if Arc::ptr_eq(current, flight) {
                inner.slots.remove(key);
            }
        }
    }

    fn evict_lru(&self, inner: &mut Inner<K, V>) {
        loop {
            let mut ready = 0usize;
            let mut oldest: Option<(&K, u64)> = None;
            for (k, slot) in &inner.slots {
                if let Slot::Ready { last_used, .. } = slot {
                    ready += 1;
                    if oldest.map_or(true, |(_, t)| *last_used < t) {
                        oldest = Some((k, *last_used));
                    }
                }
            }
            if ready <= self.capacity {
                return;
            }
            let Some(victim) = oldest.map(|(k, _)| k.clone()) else {
                return;
            };
            inner.slots.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every ready entry whose TTL has elapsed. Returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::Pending(_) => true,
        });
        let removed = before - inner.slots.len();
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop every ready entry. In-flight computations are unaffected.
    pub fn clear(&self) {
        self.lock()
            .slots
            .retain(|_, slot| matches!(slot, Slot::Pending(_)));
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .lock()
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count();
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
