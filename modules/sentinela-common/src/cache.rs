// Single-flight execution and an expiring cache built on it.
//
// Concurrent callers asking for the same key while a fetch is running await
// the one shared future instead of issuing their own request.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

type SharedResult<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// At most one in-flight operation per key.
pub struct SingleFlight<K, V, E> {
    in_flight: Arc<Mutex<HashMap<K, SharedResult<V, E>>>>,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` unless an operation for `key` is already running, in which
    /// case `work` is dropped and the running operation's result is returned.
    pub async fn run<F>(&self, key: K, work: F) -> Result<V, E>
    where
        F: Future<Output = Result<V, E>> + Send + 'static,
    {
        let shared = {
            let mut flights = self.in_flight.lock().await;
            match flights.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let registry = self.in_flight.clone();
                    let flight_key = key.clone();
                    let fut = async move {
                        let result = work.await;
                        registry.lock().await.remove(&flight_key);
                        result
                    }
                    .boxed()
                    .shared();
                    flights.insert(key, fut.clone());
                    fut
                }
            }
        };
        shared.await
    }

    pub async fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.lock().await.contains_key(key)
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct CacheEntry<V> {
    payload: V,
    expires_at: Instant,
}

/// TTL cache whose misses are filled through a [`SingleFlight`].
/// Only successful fetches are stored. Expired entries are evicted whenever
/// a new one is stored, so the map holds at most one TTL's worth of keys.
pub struct ExpiringCache<K, V, E> {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<K, CacheEntry<V>>>>,
    flights: SingleFlight<K, V, E>,
}

impl<K, V, E> ExpiringCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
            flights: SingleFlight::new(),
        }
    }

    /// Fresh cached value, if any.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.payload.clone())
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }

        let entries = self.entries.clone();
        let ttl = self.ttl;
        let entry_key = key.clone();
        let work = fetch();
        self.flights
            .run(key, async move {
                let result = work.await;
                if let Ok(payload) = &result {
                    let now = Instant::now();
                    let mut entries = entries.lock().await;
                    entries.retain(|_, e| e.expires_at > now);
                    entries.insert(
                        entry_key,
                        CacheEntry {
                            payload: payload.clone(),
                            expires_at: now + ttl,
                        },
                    );
                }
                result
            })
            .await
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_runs_share_one_execution() {
        let flights: SingleFlight<&'static str, usize, String> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first_calls = calls.clone();
        let first = flights.run("proxies", async move {
            first_calls.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.await;
            Ok(7)
        });
        let second_calls = calls.clone();
        let second = flights.run("proxies", async move {
            second_calls.fetch_add(1, Ordering::SeqCst);
            Ok(99)
        });
        let release = async {
            tokio::task::yield_now().await;
            let _ = release_tx.send(());
        };

        let (a, b, _) = tokio::join!(first, second, release);

        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight(&"proxies").await);
    }

    #[tokio::test]
    async fn cache_hits_skip_fetch() {
        let cache: ExpiringCache<String, u32, String> = ExpiringCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let v = cache
                .get_or_fetch("lima".to_string(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await;
            assert_eq!(v, Ok(42));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache: ExpiringCache<String, u32, String> = ExpiringCache::new(Duration::from_secs(60));

        let first = cache
            .get_or_fetch("callao".to_string(), || async { Err("boom".to_string()) })
            .await;
        assert_eq!(first, Err("boom".to_string()));
        assert!(cache.is_empty().await);

        let second = cache
            .get_or_fetch("callao".to_string(), || async { Ok(5) })
            .await;
        assert_eq!(second, Ok(5));
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let cache: ExpiringCache<String, u32, String> = ExpiringCache::new(Duration::from_millis(10));
        cache
            .get_or_fetch("ica".to_string(), || async { Ok(1) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(cache.get(&"ica".to_string()).await, None);

        let refreshed = cache
            .get_or_fetch("ica".to_string(), || async { Ok(2) })
            .await;
        assert_eq!(refreshed, Ok(2));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn storing_evicts_expired_keys() {
        let cache: ExpiringCache<String, u32, String> = ExpiringCache::new(Duration::from_millis(10));
        for district in ["miraflores", "surco", "barranco"] {
            cache
                .get_or_fetch(district.to_string(), || async { Ok(1) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len().await, 3);

        tokio::time::sleep(Duration::from_millis(25)).await;
        cache
            .get_or_fetch("callao".to_string(), || async { Ok(2) })
            .await
            .unwrap();

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(&"callao".to_string()).await, Some(2));
    }
}
