//! Request collapsing
//!
//! [`RequestCollapser`] lets at most one unit of work run per key at a time.
//! Callers arriving while the work is in flight wait for it and receive a
//! clone of the same outcome. Once the work finishes the key is released, so
//! the next caller starts a fresh cycle.
//!
//! The work runs on its own task. Dropping the caller that started it does not
//! cancel it, so waiters (and the cache) still get the result.
//!
//! [`KeyLocks`] is the plain per-key mutex used to serialize cache writers.

use crate::error::{DeltaError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

type Slot<T> = Arc<AsyncMutex<Option<Result<T>>>>;
type SlotMap<K, T> = Arc<Mutex<HashMap<K, Slot<T>>>>;

fn lock_map<V>(map: &Mutex<V>) -> MutexGuard<'_, V> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a caller took part in a collapsed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapseRole {
    /// This caller started the work
    Leader,
    /// This caller waited on work started by another caller
    Follower,
}

/// Held by the task running the work; publishes the result and frees the key
struct Flight<K: Eq + Hash, T> {
    key: K,
    inflight: SlotMap<K, T>,
    slot: OwnedMutexGuard<Option<Result<T>>>,
}

impl<K: Eq + Hash, T> Drop for Flight<K, T> {
    fn drop(&mut self) {
        // Unregister before the slot guard is released so late arrivals start
        // a new cycle instead of reading a finished one.
        lock_map(&self.inflight).remove(&self.key);
    }
}

/// Single-flight coordinator keyed by `K`, sharing results of type `T`
pub struct RequestCollapser<K, T> {
    inflight: SlotMap<K, T>,
}

impl<K, T> Default for RequestCollapser<K, T> {
    fn default() -> Self {
        RequestCollapser {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> RequestCollapser<K, T>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with work currently in flight
    pub fn in_flight(&self) -> usize {
        lock_map(&self.inflight).len()
    }

    /// Run `work` for `key` unless an identical run is already in flight
    pub async fn execute<F, Fut>(&self, key: K, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.execute_with_role(key, work).await.0
    }

    /// Like [`RequestCollapser::execute`], also reporting whether this caller led or waited
    pub async fn execute_with_role<F, Fut>(&self, key: K, work: F) -> (Result<T>, CollapseRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (slot, flight) = {
            let mut map = lock_map(&self.inflight);
            if let Some(existing) = map.get(&key) {
                (Arc::clone(existing), None)
            } else {
                let slot: Slot<T> = Arc::new(AsyncMutex::new(None));
                let guard = match Arc::clone(&slot).try_lock_owned() {
                    Ok(guard) => guard,
                    Err(e) => {
                        return (
                            Err(DeltaError::InternalError(format!("fresh slot already locked: {}", e))),
                            CollapseRole::Leader,
                        )
                    }
                };
                map.insert(key.clone(), Arc::clone(&slot));
                let flight = Flight {
                    key: key.clone(),
                    inflight: Arc::clone(&self.inflight),
                    slot: guard,
                };
                (slot, Some(flight))
            }
        };

        let role = match flight {
            Some(mut flight) => {
                debug!("Collapser leading work for key={:?}", key);
                let fut = work();
                tokio::spawn(async move {
                    let result = fut.await;
                    *flight.slot = Some(result);
                });
                CollapseRole::Leader
            }
            None => {
                debug!("Collapser waiting on in-flight work for key={:?}", key);
                CollapseRole::Follower
            }
        };

        let outcome = slot.lock().await;
        let result = match &*outcome {
            Some(result) => result.clone(),
            None => Err(DeltaError::InternalError(format!(
                "collapsed work for {:?} ended without a result",
                key
            ))),
        };
        (result, role)
    }
}

/// Per-key async mutexes, created on demand and dropped after the last holder
pub struct KeyLocks<K> {
    locks: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
}

impl<K> Default for KeyLocks<K> {
    fn default() -> Self {
        KeyLocks {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Exclusive access to one key; released on drop
pub struct KeyLockGuard<K: Eq + Hash> {
    key: K,
    locks: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyLockGuard<K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock_map(&self.locks);
        if let Some(lock) = locks.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

impl<K> KeyLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &K) -> KeyLockGuard<K> {
        let lock = {
            let mut locks = lock_map(&self.locks);
            Arc::clone(
                locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = lock.lock_owned().await;
        KeyLockGuard {
            key: key.clone(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or contended
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
