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

use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use burrow_common::{
    key,
    queue::{RemovableQueue, Token},
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    error::{Error, Result},
    eviction::{EvictionConfig, Policy},
    listener::{DefaultEvictionListener, EvictReason, EvictionListener},
    metrics::{Metrics, Stats},
};

/// Upper bound on cache key length, in bytes.
pub const MAX_KEY_BYTES: usize = 250;

const DEFAULT_MAX_MEMORY: usize = 1024 * 1024;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// Byte-size estimator for entries, called once per insert.
pub type Weighter<V> = Arc<dyn Fn(&str, &V) -> usize + Send + Sync + 'static>;

struct CacheEntry<V> {
    value: Arc<V>,
    charge: usize,
    expires_at: Option<Instant>,
    created_at: Instant,
    last_access_at: Instant,
    access_count: u64,
    dirty: bool,
    dirty_token: Option<Token>,
}

impl<V> CacheEntry<V> {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// `Duration::ZERO` means "never expires".
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(now + ttl)
    }
}

struct Shard<V> {
    entries: HashMap<String, CacheEntry<V>>,
    policy: Box<dyn Policy>,
    /// Write-back bookkeeping: keys with unflushed values, in insertion order.
    dirty: RemovableQueue<String>,
    usage: usize,
}

impl<V> Shard<V> {
    /// Removes the entry with all its bookkeeping, crediting its charge back.
    fn detach(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.usage -= entry.charge;
        self.policy.remove(key);
        if let Some(token) = entry.dirty_token {
            self.dirty.remove(token);
        }
        Some(entry)
    }
}

enum Lookup {
    Miss,
    Expired,
    Hit,
}

struct Inner<V> {
    shard: Mutex<Shard<V>>,
    metrics: Metrics,
    weighter: Weighter<V>,
    listener: Arc<dyn EvictionListener<V>>,
    max_memory: usize,
    max_count: usize,
    default_ttl: Duration,
    shutdown: CancellationToken,
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type Events<V> = Vec<(String, Arc<V>, EvictReason)>;

impl<V> Inner<V>
where
    V: Send + Sync + 'static,
{
    /// Fires the listener for removals collected inside the critical
    /// section. Must be called with the shard lock released.
    fn dispatch(&self, events: Events<V>) {
        for (key, value, reason) in events {
            self.listener.on_evict(&key, value, reason);
        }
    }

    fn insert_inner(&self, key: String, value: V, ttl: Duration, dirty: bool) -> Result<Arc<V>> {
        key::validate(&key, MAX_KEY_BYTES)?;
        let value = Arc::new(value);
        let charge = (self.weighter)(&key, &value);
        if self.max_memory > 0 && charge > self.max_memory {
            return Err(Error::invalid_input(format!(
                "entry of {charge} bytes cannot fit a {} byte cache",
                self.max_memory
            )));
        }

        let now = Instant::now();
        let mut events: Events<V> = vec![];
        {
            let mut shard = self.shard.lock();

            if let Some(old) = shard.detach(&key) {
                self.metrics.replace.fetch_add(1, Ordering::Relaxed);
                events.push((key.clone(), old.value, EvictReason::Replaced));
            } else {
                self.metrics.insert.fetch_add(1, Ordering::Relaxed);
            }

            while (self.max_memory > 0 && shard.usage + charge > self.max_memory)
                || (self.max_count > 0 && shard.entries.len() >= self.max_count)
            {
                let Some(victim) = shard.policy.evict() else {
                    break;
                };
                if let Some(entry) = shard.detach(&victim) {
                    self.metrics.eviction.fetch_add(1, Ordering::Relaxed);
                    trace!(key = %victim, charge = entry.charge, "evicted");
                    events.push((victim, entry.value, EvictReason::Evicted));
                }
            }

            let mut entry = CacheEntry {
                value: value.clone(),
                charge,
                expires_at: deadline(now, ttl),
                created_at: now,
                last_access_at: now,
                access_count: 0,
                dirty,
                dirty_token: None,
            };
            if dirty {
                entry.dirty_token = Some(shard.dirty.push(key.clone()));
            }
            shard.usage += charge;
            shard.policy.touch(&key);
            shard.entries.insert(key, entry);
        }
        self.dispatch(events);
        Ok(value)
    }

    fn get_inner(&self, key: &str) -> Result<Arc<V>> {
        key::validate(key, MAX_KEY_BYTES)?;
        let now = Instant::now();
        let mut events: Events<V> = vec![];
        let result = {
            let mut guard = self.shard.lock();
            let shard = &mut *guard;
            let lookup = match shard.entries.get(key) {
                None => Lookup::Miss,
                Some(entry) if entry.expired(now) => Lookup::Expired,
                Some(_) => Lookup::Hit,
            };
            match lookup {
                Lookup::Miss => {
                    self.metrics.miss.fetch_add(1, Ordering::Relaxed);
                    Err(Error::NotFound)
                }
                Lookup::Expired => {
                    if let Some(entry) = shard.detach(key) {
                        events.push((key.to_string(), entry.value, EvictReason::Expired));
                    }
                    self.metrics.expiration.fetch_add(1, Ordering::Relaxed);
                    self.metrics.miss.fetch_add(1, Ordering::Relaxed);
                    Err(Error::NotFound)
                }
                Lookup::Hit => match shard.entries.get_mut(key) {
                    Some(entry) => {
                        entry.last_access_at = now;
                        entry.access_count += 1;
                        let value = entry.value.clone();
                        shard.policy.touch(key);
                        self.metrics.hit.fetch_add(1, Ordering::Relaxed);
                        Ok(value)
                    }
                    None => Err(Error::NotFound),
                },
            }
        };
        self.dispatch(events);
        result
    }

    fn take_inner(&self, key: &str) -> Result<Arc<V>> {
        key::validate(key, MAX_KEY_BYTES)?;
        let now = Instant::now();
        let mut events: Events<V> = vec![];
        let result = {
            let mut shard = self.shard.lock();
            match shard.detach(key) {
                None => {
                    self.metrics.miss.fetch_add(1, Ordering::Relaxed);
                    Err(Error::NotFound)
                }
                Some(entry) if entry.expired(now) => {
                    events.push((key.to_string(), entry.value, EvictReason::Expired));
                    self.metrics.expiration.fetch_add(1, Ordering::Relaxed);
                    self.metrics.miss.fetch_add(1, Ordering::Relaxed);
                    Err(Error::NotFound)
                }
                Some(entry) => {
                    self.metrics.remove.fetch_add(1, Ordering::Relaxed);
                    Ok(entry.value)
                }
            }
        };
        self.dispatch(events);
        result
    }

    /// Drops every expired entry. Returns how many were dropped.
    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut events: Events<V> = vec![];
        {
            let mut shard = self.shard.lock();
            let expired = shard
                .entries
                .iter()
                .filter(|(_, entry)| entry.expired(now))
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            for key in expired {
                if let Some(entry) = shard.detach(&key) {
                    self.metrics.expiration.fetch_add(1, Ordering::Relaxed);
                    events.push((key, entry.value, EvictReason::Expired));
                }
            }
        }
        let swept = events.len();
        self.dispatch(events);
        swept
    }
}

/// A bounded in-memory cache with TTL expiry and LRU/FIFO eviction.
///
/// `Cache` is a cheap clone-able handle; all clones share the same state.
/// Values are stored behind `Arc` and handed out as `Arc<V>` clones.
pub struct Cache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> std::fmt::Debug for Cache<V>
where
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("len", &self.len())
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}

impl<V> Cache<V>
where
    V: Send + Sync + 'static,
{
    pub fn builder() -> CacheBuilder<V> {
        CacheBuilder::new()
    }

    /// Inserts `key` with the configured default TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) -> Result<Arc<V>> {
        let ttl = self.inner.default_ttl;
        self.inner.insert_inner(key.into(), value, ttl, false)
    }

    /// Inserts `key` with an explicit TTL. `Duration::ZERO` never expires.
    pub fn insert_with_ttl(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
    ) -> Result<Arc<V>> {
        self.inner.insert_inner(key.into(), value, ttl, false)
    }

    /// Looks `key` up, refreshing its recency. Expired entries count as
    /// absent and are dropped on the spot.
    pub fn get(&self, key: &str) -> Result<Arc<V>> {
        self.inner.get_inner(key)
    }

    /// Removes `key`. Removing an absent key is not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        key::validate(key, MAX_KEY_BYTES)?;
        let mut shard = self.inner.shard.lock();
        if shard.detach(key).is_some() {
            self.inner
                .metrics
                .remove
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Atomic get-then-remove: the entry is returned exactly once.
    pub fn take(&self, key: &str) -> Result<Arc<V>> {
        self.inner.take_inner(key)
    }

    /// Whether a live (non-expired) entry exists. Does not refresh recency.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let shard = self.inner.shard.lock();
        shard.entries.get(key).is_some_and(|entry| !entry.expired(now))
    }

    pub fn clear(&self) {
        let mut shard = self.inner.shard.lock();
        shard.entries.clear();
        shard.policy.clear();
        shard.dirty.clear();
        shard.usage = 0;
    }

    /// Number of resident entries, including expired ones the sweeper has
    /// not visited yet.
    pub fn len(&self) -> usize {
        self.inner.shard.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.shard.lock().usage
    }

    pub fn stats(&self) -> Stats {
        let (usage, count) = {
            let shard = self.inner.shard.lock();
            (shard.usage, shard.entries.len())
        };
        self.inner.metrics.snapshot(usage, count)
    }

    /// Drops every expired entry now, without waiting for the sweeper.
    pub fn sweep(&self) -> usize {
        self.inner.sweep_expired()
    }

    pub(crate) fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    pub(crate) fn insert_dirty(&self, key: String, value: V, ttl: Duration) -> Result<Arc<V>> {
        self.inner.insert_inner(key, value, ttl, true)
    }

    /// Clears the dirty flag of `key`, but only if the entry still holds
    /// the value that was flushed; an overwrite that raced the flush stays
    /// dirty.
    pub(crate) fn mark_clean(&self, key: &str, flushed: &Arc<V>) {
        let mut shard = self.inner.shard.lock();
        let mut cleaned = None;
        if let Some(entry) = shard.entries.get_mut(key) {
            if Arc::ptr_eq(&entry.value, flushed) {
                entry.dirty = false;
                cleaned = entry.dirty_token.take();
            }
        }
        if let Some(token) = cleaned {
            shard.dirty.remove(token);
        }
    }

    pub(crate) fn dirty_len(&self) -> usize {
        self.inner.shard.lock().dirty.len()
    }

    /// Up to `limit` dirty entries in insertion order.
    pub(crate) fn dirty_batch(&self, limit: usize) -> Vec<(String, Arc<V>)> {
        let shard = self.inner.shard.lock();
        shard
            .dirty
            .iter()
            .take(limit)
            .filter_map(|key| {
                shard
                    .entries
                    .get(key)
                    .map(|entry| (key.clone(), entry.value.clone()))
            })
            .collect()
    }
}

/// Builder for [`Cache`].
pub struct CacheBuilder<V> {
    max_memory: usize,
    max_count: usize,
    default_ttl: Duration,
    cleanup_interval: Duration,
    eviction: EvictionConfig,
    weighter: Weighter<V>,
    listener: Arc<dyn EvictionListener<V>>,
}

impl<V> Default for CacheBuilder<V>
where
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheBuilder<V>
where
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_memory: DEFAULT_MAX_MEMORY,
            max_count: 0,
            default_ttl: DEFAULT_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            eviction: EvictionConfig::default(),
            weighter: Arc::new(|key: &str, _: &V| key.len() + std::mem::size_of::<V>()),
            listener: Arc::new(DefaultEvictionListener),
        }
    }

    /// Memory cap in bytes. `0` means unlimited. Defaults to 1 MiB.
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Entry-count cap. `0` means unlimited.
    pub fn with_max_count(mut self, count: usize) -> Self {
        self.max_count = count;
        self
    }

    /// TTL applied by [`Cache::insert`]. `Duration::ZERO` never expires.
    /// Defaults to 1 hour.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Period of the background expiry sweeper. `Duration::ZERO` disables
    /// it (expiry still happens lazily on access). Defaults to 10 minutes.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_weighter(
        mut self,
        weighter: impl Fn(&str, &V) -> usize + Send + Sync + 'static,
    ) -> Self {
        self.weighter = Arc::new(weighter);
        self
    }

    pub fn with_event_listener(mut self, listener: impl EvictionListener<V>) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    /// Builds the cache. When called inside a tokio runtime the expiry
    /// sweeper task is started; outside one, expiry is lazy only.
    pub fn build(self) -> Cache<V> {
        let inner = Arc::new(Inner {
            shard: Mutex::new(Shard {
                entries: HashMap::new(),
                policy: self.eviction.build(),
                dirty: RemovableQueue::new(),
                usage: 0,
            }),
            metrics: Metrics::default(),
            weighter: self.weighter,
            listener: self.listener,
            max_memory: self.max_memory,
            max_count: self.max_count,
            default_ttl: self.default_ttl,
            shutdown: CancellationToken::new(),
        });

        if !self.cleanup_interval.is_zero() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                spawn_sweeper(&inner, self.cleanup_interval, &handle);
            }
        }

        Cache { inner }
    }
}

/// The sweeper holds only a weak reference so it cannot keep a dropped
/// cache alive; the cancellation token covers prompt shutdown.
fn spawn_sweeper<V>(
    inner: &Arc<Inner<V>>,
    interval: Duration,
    handle: &tokio::runtime::Handle,
) where
    V: Send + Sync + 'static,
{
    let weak = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    handle.spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut tick = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { break };
            let swept = inner.sweep_expired();
            if swept > 0 {
                debug!(swept, "expiry sweep");
            }
        }
    });
}
