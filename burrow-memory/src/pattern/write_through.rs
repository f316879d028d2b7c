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

use std::{sync::Arc, time::Duration};

use burrow_common::key;

use crate::{
    cache::{Cache, MAX_KEY_BYTES},
    error::{Error, Result},
    pattern::StoreWriter,
};

/// Write-through wrapper: the downstream store is written first, and only a
/// successful write inserts into the cache.
///
/// On writer failure the cache is left untouched and the error surfaces as
/// [`Error::Writer`].
pub struct WriteThroughCache<V, W> {
    cache: Cache<V>,
    writer: W,
}

impl<V, W> WriteThroughCache<V, W>
where
    V: Send + Sync + 'static,
    W: StoreWriter<V>,
{
    pub fn new(cache: Cache<V>, writer: W) -> Self {
        Self { cache, writer }
    }

    pub fn cache(&self) -> &Cache<V> {
        &self.cache
    }

    /// `insert_through` with the cache's default TTL.
    pub async fn insert_through(&self, key: impl Into<String>, value: V) -> Result<Arc<V>> {
        let ttl = self.cache.default_ttl();
        self.insert_through_with_ttl(key, value, ttl).await
    }

    pub async fn insert_through_with_ttl(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
    ) -> Result<Arc<V>> {
        let key = key.into();
        // Validate before touching the store so a doomed insert writes nothing.
        key::validate(&key, MAX_KEY_BYTES)?;
        self.writer
            .write(&key, &value)
            .await
            .map_err(Error::writer)?;
        self.cache.insert_with_ttl(key, value, ttl)
    }

    pub fn get(&self, key: &str) -> Result<Arc<V>> {
        self.cache.get(key)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.cache.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[tokio::test]
    async fn test_write_then_insert() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        let wt = WriteThroughCache::new(
            Cache::builder().build(),
            move |key: &str, value: &u64| {
                let sink = sink.clone();
                let record = (key.to_string(), *value);
                async move {
                    sink.lock().push(record);
                    Ok(())
                }
            },
        );

        wt.insert_through("k", 7).await.unwrap();
        assert_eq!(*wt.get("k").unwrap(), 7);
        assert_eq!(written.lock().as_slice(), &[("k".to_string(), 7)]);
    }

    #[tokio::test]
    async fn test_writer_failure_leaves_cache_untouched() {
        let wt = WriteThroughCache::new(
            Cache::builder().build(),
            |_: &str, _: &u64| async move { anyhow::bail!("store down") },
        );

        let err = wt.insert_through("k", 7).await.unwrap_err();
        assert!(matches!(err, Error::Writer(_)));
        assert!(!wt.cache().contains("k"));
    }

    #[tokio::test]
    async fn test_invalid_key_skips_writer() {
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = writes.clone();
        let wt = WriteThroughCache::new(
            Cache::builder().build(),
            move |_: &str, _: &u64| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        let err = wt.insert_through("", 7).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }
}
