//  Copyright 2024 Burrow Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{future::Future, sync::Arc, time::Duration};

use burrow_common::singleflight::SingleFlight;

use crate::{
    cache::Cache,
    error::{Error, Result},
};

/// Read-through wrapper: misses fall through to a loader whose result is
/// stored before being returned.
///
/// Concurrent loads of the same key coalesce: the loader runs at most once
/// per key at a time and every waiter observes that invocation's outcome,
/// success or failure. Failures are surfaced as [`Error::Loader`] and never
/// cached. The loader runs with no cache lock held.
pub struct ReadThroughCache<V> {
    cache: Cache<V>,
    flight: SingleFlight<Result<Arc<V>>>,
}

impl<V> std::fmt::Debug for ReadThroughCache<V>
where
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("cache", &self.cache.len())
            .field("in_flight", &self.flight.in_flight())
            .finish()
    }
}

impl<V> ReadThroughCache<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(cache: Cache<V>) -> Self {
        Self {
            cache,
            flight: SingleFlight::new(),
        }
    }

    pub fn cache(&self) -> &Cache<V> {
        &self.cache
    }

    /// `get_or_load` with the cache's default TTL for stored loads.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> Result<Arc<V>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send,
    {
        self.get_or_load_with_ttl(key, self.cache.default_ttl(), loader)
            .await
    }

    pub async fn get_or_load_with_ttl<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Arc<V>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send,
    {
        match self.cache.get(key) {
            Ok(value) => return Ok(value),
            Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }

        let cache = self.cache.clone();
        let owned = key.to_string();
        self.flight
            .flight(key, move || async move {
                // A racing leader may have stored the value after our miss.
                match cache.get(&owned) {
                    Ok(value) => return Ok(value),
                    Err(Error::NotFound) => {}
                    Err(err) => return Err(err),
                }
                match loader(owned.clone()).await {
                    Ok(value) => cache.insert_with_ttl(owned, value, ttl),
                    Err(err) => Err(Error::loader(err)),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn cache() -> Cache<String> {
        Cache::builder().build()
    }

    #[tokio::test]
    async fn test_miss_loads_and_stores() {
        let rt = ReadThroughCache::new(cache());
        let value = rt
            .get_or_load("k", |key| async move { Ok(format!("value-of-{key}")) })
            .await
            .unwrap();
        assert_eq!(*value, "value-of-k");
        // now a plain hit
        assert_eq!(*rt.cache().get("k").unwrap(), "value-of-k");
    }

    #[tokio::test]
    async fn test_hit_skips_loader() {
        let rt = ReadThroughCache::new(cache());
        rt.cache().insert("k", "cached".to_string()).unwrap();
        let value = rt
            .get_or_load("k", |_| async move { anyhow::bail!("loader must not run") })
            .await
            .unwrap();
        assert_eq!(*value, "cached");
    }

    #[tokio::test]
    async fn test_concurrent_loads_coalesce() {
        let rt = Arc::new(ReadThroughCache::new(cache()));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles = (0..16)
            .map(|_| {
                let rt = rt.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    rt.get_or_load("k", move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("loaded".to_string())
                    })
                    .await
                    .unwrap()
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            assert_eq!(*handle.await.unwrap(), "loaded");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loader_failure_not_cached() {
        let rt = ReadThroughCache::new(cache());
        let err = rt
            .get_or_load("k", |_| async move {
                anyhow::bail!("upstream down")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Loader(_)));
        assert!(!rt.cache().contains("k"));

        // the next call retries the loader
        let value = rt
            .get_or_load("k", |_| async move { Ok("recovered".to_string()) })
            .await
            .unwrap();
        assert_eq!(*value, "recovered");
    }
}
