//! Keyed mutual exclusion primitives.
//! -----------------------------------
//! `SingleFlight` runs at most one operation per key; callers arriving while it is
//! in flight await the same result instead of starting their own. `KeyedLocks`
//! serializes whole critical sections per key (used where every caller must run,
//! but never two at once for the same key).

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Flight<V> = Shared<BoxFuture<'static, V>>;

pub struct SingleFlight<K, V>
where
    V: Clone,
{
    inflight: Arc<Mutex<HashMap<K, (u64, Flight<V>)>>>,
    next_gen: Mutex<u64>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    V: Clone,
{
    fn default() -> Self {
        Self { inflight: Arc::new(Mutex::new(HashMap::new())), next_gen: Mutex::new(0) }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self { Self::default() }

    /// Run `op` for `key` unless an operation for the same key is already running,
    /// in which case wait for that one and return its result.
    pub async fn run<F, Fut>(&self, key: K, op: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let flight = {
            let mut map = self.inflight.lock();
            if let Some((_, existing)) = map.get(&key) {
                existing.clone()
            } else {
                let gen = {
                    let mut g = self.next_gen.lock();
                    *g += 1;
                    *g
                };
                // The entry is removed by the flight itself so a dropped leader
                // cannot leave a finished result behind for later callers.
                let registry = Arc::clone(&self.inflight);
                let cleanup_key = key.clone();
                let fut = op();
                let flight: Flight<V> = async move {
                    let out = fut.await;
                    let mut map = registry.lock();
                    if map.get(&cleanup_key).map(|(g, _)| *g == gen).unwrap_or(false) {
                        map.remove(&cleanup_key);
                    }
                    out
                }
                .boxed()
                .shared();
                map.insert(key, (gen, flight.clone()));
                flight
            }
        };
        flight.await
    }

    pub fn is_in_flight(&self, key: &K) -> bool { self.inflight.lock().contains_key(key) }

    pub fn in_flight_count(&self) -> usize { self.inflight.lock().len() }
}

/// One async mutex per key, created on demand.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self { Self { locks: Mutex::new(HashMap::new()) } }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self { Self::default() }

    pub async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
        };
        lock.lock_owned().await
    }

    /// Drop lock entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.lock().retain(|_, l| Arc::strong_count(l) > 1);
    }

    pub fn len(&self) -> usize { self.locks.lock().len() }
    pub fn is_empty(&self) -> bool { self.locks.lock().is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let sf: Arc<SingleFlight<String, usize>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = Arc::clone(&sf);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                sf.run("u1".to_string(), move || async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    runs.fetch_add(1, Ordering::SeqCst) + 1
                })
                .await
            }));
        }
        let results: Vec<usize> = futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|v| *v == 1));
        assert!(!sf.is_in_flight(&"u1".to_string()));
    }

    #[tokio::test]
    async fn sequential_calls_run_again() {
        let sf: SingleFlight<&'static str, u32> = SingleFlight::new();
        assert_eq!(sf.run("k", || async { 1 }).await, 1);
        assert_eq!(sf.run("k", || async { 2 }).await, 2);
        assert_eq!(sf.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let sf: Arc<SingleFlight<u8, u8>> = Arc::new(SingleFlight::new());
        let a = sf.run(1, || async { 10 });
        let b = sf.run(2, || async { 20 });
        let (a, b) = tokio::join!(a, b);
        assert_eq!((a, b), (10, 20));
    }

    #[tokio::test]
    async fn dropped_leader_does_not_leave_stale_entry() {
        let sf: Arc<SingleFlight<u8, u8>> = Arc::new(SingleFlight::new());
        let leader = {
            let sf = Arc::clone(&sf);
            tokio::spawn(async move {
                sf.run(7, || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    1
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let follower = {
            let sf = Arc::clone(&sf);
            tokio::spawn(async move { sf.run(7, || async { 2 }).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        leader.abort();
        assert_eq!(follower.await.unwrap(), 1);
        assert_eq!(sf.run(7, || async { 3 }).await, 3);
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let locks: Arc<KeyedLocks<String>> = Arc::new(KeyedLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let locks = Arc::clone(&locks);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire(&"attendance:T".to_string()).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        futures::future::join_all(handles).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        locks.prune();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn prune_keeps_held_and_awaited_keys() {
        let locks: KeyedLocks<&str> = KeyedLocks::new();
        let held = locks.acquire(&"a").await;
        drop(locks.acquire(&"b").await);
        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }
}
