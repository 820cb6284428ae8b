//! Per-key memoization of an expensive derived metric with a minimum
//! recompute interval.
//!
//! Each key owns an async flight lock. Callers that arrive while a computation
//! is in flight queue on that lock and then read the fresh value, so a burst
//! of requests for one key costs at most one computation per interval.
//! Failed computations leave the slot untouched; the next caller retries.
//! The last value sits outside the flight lock, so `peek` never waits.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

struct Slot<V> {
    value: Mutex<Option<(V, Instant)>>,
    flight: tokio::sync::Mutex<()>,
}

impl<V: Clone> Slot<V> {
    fn fresh(&self, min_interval: Duration) -> Option<V> {
        let value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        match &*value {
            Some((value, computed_at)) if computed_at.elapsed() < min_interval => {
                Some(value.clone())
            }
            _ => None,
        }
    }
}

pub struct RateLimitedCache<V> {
    slots: Mutex<HashMap<String, Arc<Slot<V>>>>,
    computations: AtomicU64,
}

impl<V> Default for RateLimitedCache<V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            computations: AtomicU64::new(0),
        }
    }
}

impl<V: Clone> RateLimitedCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Slot<V>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    value: Mutex::new(None),
                    flight: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }

    /// Returns the cached value while it is younger than `min_interval`,
    /// otherwise runs `compute` and caches its success.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        min_interval: Duration,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(key);
        if let Some(value) = slot.fresh(min_interval) {
            return Ok(value);
        }
        let _flight = slot.flight.lock().await;
        if let Some(value) = slot.fresh(min_interval) {
            return Ok(value);
        }
        self.computations.fetch_add(1, Ordering::Relaxed);
        let value = compute().await?;
        *slot.value.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((value.clone(), Instant::now()));
        Ok(value)
    }

    /// Last successful value regardless of age, even while a recompute runs.
    pub fn peek(&self, key: &str) -> Option<V> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        let value = slot.value.lock().unwrap_or_else(PoisonError::into_inner);
        value.as_ref().map(|(value, _)| value.clone())
    }

    /// Forgets a key. A computation already in flight for it finishes but
    /// its result is not visible to later callers.
    pub fn invalidate(&self, key: &str) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Number of computations started, successful or not.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_computation() {
        let cache = Arc::new(RateLimitedCache::<f64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_compute("A1", Duration::from_millis(2_000), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok::<_, String>(12.5)
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.expect("join"), Ok(12.5));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.computations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn value_expires_after_min_interval() {
        let cache = RateLimitedCache::<u32>::new();
        let interval = Duration::from_secs(10);

        let first = cache
            .get_or_compute("A1", interval, || async { Ok::<_, String>(1) })
            .await;
        tokio::time::advance(Duration::from_secs(9)).await;
        let cached = cache
            .get_or_compute("A1", interval, || async { Ok::<_, String>(2) })
            .await;
        tokio::time::advance(Duration::from_secs(1)).await;
        let fresh = cache
            .get_or_compute("A1", interval, || async { Ok::<_, String>(3) })
            .await;

        assert_eq!((first, cached, fresh), (Ok(1), Ok(1), Ok(3)));
        assert_eq!(cache.peek("A1"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let cache = RateLimitedCache::<&'static str>::new();
        let interval = Duration::from_secs(10);
        let a = cache
            .get_or_compute("A1", interval, || async { Ok::<_, String>("a") })
            .await;
        let b = cache
            .get_or_compute("A2", interval, || async { Ok::<_, String>("b") })
            .await;
        assert_eq!((a, b), (Ok("a"), Ok("b")));
        assert_eq!(cache.computations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let cache = RateLimitedCache::<u32>::new();
        let interval = Duration::from_secs(10);

        let failed = cache
            .get_or_compute("A1", interval, || async { Err::<u32, _>("backend down") })
            .await;
        assert_eq!(failed, Err("backend down"));
        assert_eq!(cache.peek("A1"), None);

        let retried = cache
            .get_or_compute("A1", interval, || async { Ok::<_, &str>(4) })
            .await;
        assert_eq!(retried, Ok(4));
        assert_eq!(cache.computations(), 2);

        cache.invalidate("A1");
        assert_eq!(cache.peek("A1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn peek_serves_stale_value_during_recompute() {
        let cache = Arc::new(RateLimitedCache::<u32>::new());
        let interval = Duration::from_secs(1);
        cache
            .get_or_compute("A1", interval, || async { Ok::<_, String>(1) })
            .await
            .expect("first");
        tokio::time::advance(Duration::from_secs(2)).await;

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("A1", interval, || async {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                        Ok::<_, String>(2)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.peek("A1"), Some(1));

        assert_eq!(slow.await.expect("join"), Ok(2));
        assert_eq!(cache.peek("A1"), Some(2));
    }
}
