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

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cache::Cache,
    error::{Error, Result},
    pattern::StoreWriter,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBackConfig {
    /// Period of the background flusher. Defaults to 1 minute.
    pub flush_interval: Duration,
    /// Dirty-count threshold that triggers an early flush, and the maximum
    /// entries processed per flush tick. Defaults to 100.
    pub batch_size: usize,
    /// Extra write attempts per entry before it is left dirty for the next
    /// tick. Defaults to 3.
    pub max_retries: usize,
    /// Pause between write attempts. Defaults to 100 ms.
    pub retry_delay: Duration,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            batch_size: 100,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

struct WriteBackInner<V, W> {
    cache: Cache<V>,
    writer: W,
    config: WriteBackConfig,
    dirty_full: Arc<Notify>,
    shutdown: CancellationToken,
}

impl<V, W> Drop for WriteBackInner<V, W> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<V, W> WriteBackInner<V, W>
where
    V: Send + Sync + 'static,
    W: StoreWriter<V>,
{
    /// Writes up to `limit` dirty entries in insertion order. Entries whose
    /// writes keep failing stay dirty; the last failure is surfaced after
    /// the whole batch has been attempted.
    async fn flush_limit(&self, limit: usize) -> Result<usize> {
        let batch = self.cache.dirty_batch(limit);
        let mut flushed = 0;
        let mut last_err = None;
        for (key, value) in batch {
            let mut attempt = 0;
            loop {
                match self.writer.write(&key, value.as_ref()).await {
                    Ok(()) => {
                        self.cache.mark_clean(&key, &value);
                        flushed += 1;
                        break;
                    }
                    Err(err) if attempt < self.config.max_retries => {
                        attempt += 1;
                        debug!(%key, attempt, %err, "write-back attempt failed, retrying");
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                    Err(err) => {
                        warn!(%key, %err, "write-back flush failed, entry stays dirty");
                        last_err = Some(Error::writer(err));
                        break;
                    }
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(flushed),
        }
    }
}

/// Write-back wrapper: inserts are marked dirty and written to the
/// downstream store later, in insertion order, by batched flushes.
///
/// A background flusher fires when `flush_interval` elapses or when the
/// dirty count reaches `batch_size`, whichever comes first. Failed writes
/// leave their entries dirty for the next tick.
pub struct WriteBackCache<V, W> {
    inner: Arc<WriteBackInner<V, W>>,
}

impl<V, W> Clone for WriteBackCache<V, W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V, W> WriteBackCache<V, W>
where
    V: Send + Sync + 'static,
    W: StoreWriter<V>,
{
    /// Builds the wrapper. When called inside a tokio runtime the
    /// background flusher is started; outside one, only explicit flushes
    /// run.
    pub fn new(cache: Cache<V>, writer: W, config: WriteBackConfig) -> Self {
        let inner = Arc::new(WriteBackInner {
            cache,
            writer,
            config,
            dirty_full: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            spawn_flusher(&inner, &handle);
        }
        Self { inner }
    }

    pub fn cache(&self) -> &Cache<V> {
        &self.inner.cache
    }

    /// Inserts with the cache's default TTL, marking the entry dirty.
    pub fn insert_dirty(&self, key: impl Into<String>, value: V) -> Result<Arc<V>> {
        let ttl = self.inner.cache.default_ttl();
        self.insert_dirty_with_ttl(key, value, ttl)
    }

    pub fn insert_dirty_with_ttl(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
    ) -> Result<Arc<V>> {
        let value = self.inner.cache.insert_dirty(key.into(), value, ttl)?;
        if self.inner.cache.dirty_len() >= self.inner.config.batch_size {
            self.inner.dirty_full.notify_one();
        }
        Ok(value)
    }

    pub fn get(&self, key: &str) -> Result<Arc<V>> {
        self.inner.cache.get(key)
    }

    pub fn dirty_len(&self) -> usize {
        self.inner.cache.dirty_len()
    }

    /// Flushes one batch of up to `batch_size` dirty entries.
    pub async fn flush(&self) -> Result<usize> {
        self.inner.flush_limit(self.inner.config.batch_size).await
    }

    /// Flushes every dirty entry in insertion order.
    pub async fn flush_all(&self) -> Result<usize> {
        self.inner.flush_limit(usize::MAX).await
    }

    /// Stops the background flusher and drains the dirty entries.
    pub async fn close(&self) -> Result<usize> {
        self.inner.shutdown.cancel();
        self.flush_all().await
    }
}

fn spawn_flusher<V, W>(inner: &Arc<WriteBackInner<V, W>>, handle: &tokio::runtime::Handle)
where
    V: Send + Sync + 'static,
    W: StoreWriter<V>,
{
    let weak = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    let dirty_full = inner.dirty_full.clone();
    let period = inner.config.flush_interval;
    handle.spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut tick = tokio::time::interval_at(start, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
                _ = dirty_full.notified() => {}
            }
            let Some(inner) = weak.upgrade() else { break };
            match inner.flush_limit(inner.config.batch_size).await {
                Ok(flushed) if flushed > 0 => debug!(flushed, "write-back flush"),
                Ok(_) => {}
                Err(err) => debug!(%err, "write-back flush left dirty entries"),
            }
        }
    });
}
