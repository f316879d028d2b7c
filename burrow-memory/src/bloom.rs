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

//! Bloom filter and the penetration gate built on it.
//!
//! The filter is sized from the expected key count and the target
//! false-positive rate with the standard formulas, and uses double hashing
//! over two independently seeded states. Bits live in atomic words, so
//! `insert` and `might_contain` take `&self`.

use std::{
    future::Future,
    hash::BuildHasher,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use ahash::RandomState;
use burrow_common::key;

use crate::{
    cache::Cache,
    error::{Error, Result},
    pattern::read_through::ReadThroughCache,
};

/// Upper bound on bloom key length, in bytes.
pub const MAX_KEY_BYTES: usize = 1000;

const WORD_BITS: usize = u64::BITS as usize;

pub struct BloomFilter {
    words: Vec<AtomicU64>,
    bits: usize,
    hashes: u32,
    expected: usize,
    target_fpr: f64,
    added: AtomicU64,
    set_bits: AtomicU64,
    state_a: RandomState,
    state_b: RandomState,
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &self.bits)
            .field("hashes", &self.hashes)
            .field("expected", &self.expected)
            .field("target_fpr", &self.target_fpr)
            .field("added", &self.added_count())
            .finish()
    }
}

impl BloomFilter {
    /// Sizes a filter for `expected` keys at false-positive rate `fpr`:
    /// `m = ceil(-n ln p / (ln 2)^2)` bits and `k = max(1, ceil(m/n ln 2))`
    /// hash probes.
    pub fn new(expected: usize, fpr: f64) -> Result<Self> {
        if expected == 0 {
            return Err(Error::invalid_input("bloom expected count must be positive"));
        }
        if !(fpr > 0.0 && fpr < 1.0) {
            return Err(Error::invalid_input(format!(
                "bloom false-positive rate must be in (0, 1), got {fpr}"
            )));
        }

        let ln2 = std::f64::consts::LN_2;
        let bits = ((-(expected as f64) * fpr.ln()) / (ln2 * ln2)).ceil() as usize;
        let bits = bits.max(WORD_BITS);
        let hashes = ((bits as f64 / expected as f64) * ln2).ceil().max(1.0) as u32;

        let words = (0..bits.div_ceil(WORD_BITS))
            .map(|_| AtomicU64::new(0))
            .collect();

        Ok(Self {
            words,
            bits,
            hashes,
            expected,
            target_fpr: fpr,
            added: AtomicU64::new(0),
            set_bits: AtomicU64::new(0),
            state_a: RandomState::with_seeds(0x243f_6a88, 0x85a3_08d3, 0x1319_8a2e, 0x0370_7344),
            state_b: RandomState::with_seeds(0xa409_3822, 0x299f_31d0, 0x082e_fa98, 0xec4e_6c89),
        })
    }

    /// Double hashing: probe `i` lands on `(a + i * b) mod m`.
    fn probes(&self, key: &str) -> impl Iterator<Item = usize> + '_ {
        let a = self.state_a.hash_one(key);
        let b = self.state_b.hash_one(key);
        let bits = self.bits as u64;
        (0..self.hashes as u64).map(move |i| (a.wrapping_add(i.wrapping_mul(b)) % bits) as usize)
    }

    pub fn insert(&self, key: &str) -> Result<()> {
        key::validate(key, MAX_KEY_BYTES)?;
        for probe in self.probes(key) {
            let mask = 1u64 << (probe % WORD_BITS);
            let old = self.words[probe / WORD_BITS].fetch_or(mask, Ordering::Relaxed);
            if old & mask == 0 {
                self.set_bits.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// `false` is definitive; `true` is advisory (tunable false positives).
    /// Keys that would fail validation were never inserted, so they report
    /// `false`.
    pub fn might_contain(&self, key: &str) -> bool {
        if key::validate(key, MAX_KEY_BYTES).is_err() {
            return false;
        }
        self.probes(key).all(|probe| {
            let mask = 1u64 << (probe % WORD_BITS);
            self.words[probe / WORD_BITS].load(Ordering::Relaxed) & mask != 0
        })
    }

    /// Expected false-positive rate at the current fill:
    /// `(1 - e^(-k n / m))^k` with `n` the added-key count.
    pub fn estimate_fpr(&self) -> f64 {
        let k = self.hashes as f64;
        let n = self.added_count() as f64;
        let m = self.bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Erases membership knowledge for every key ever inserted.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
        self.added.store(0, Ordering::Relaxed);
        self.set_bits.store(0, Ordering::Relaxed);
    }

    pub fn bit_count(&self) -> usize {
        self.bits
    }

    pub fn hash_count(&self) -> u32 {
        self.hashes
    }

    pub fn added_count(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    pub fn set_bit_count(&self) -> u64 {
        self.set_bits.load(Ordering::Relaxed)
    }

    /// Fraction of bits set, in `[0, 1]`.
    pub fn fill_ratio(&self) -> f64 {
        self.set_bit_count() as f64 / self.bits as f64
    }
}

/// Read-through cache gated by a Bloom filter against cache penetration.
///
/// A key the filter has never seen short-circuits to [`Error::NotFound`]
/// without invoking the loader. Successful loads and direct inserts feed
/// the filter.
pub struct BloomGatedCache<V> {
    inner: ReadThroughCache<V>,
    filter: BloomFilter,
}

impl<V> std::fmt::Debug for BloomGatedCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomGatedCache")
            .field("filter", &self.filter)
            .finish()
    }
}

impl<V> BloomGatedCache<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(cache: Cache<V>, expected: usize, fpr: f64) -> Result<Self> {
        Ok(Self {
            inner: ReadThroughCache::new(cache),
            filter: BloomFilter::new(expected, fpr)?,
        })
    }

    pub fn cache(&self) -> &Cache<V> {
        self.inner.cache()
    }

    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }

    /// Inserts directly, feeding the filter.
    pub fn insert(&self, key: impl Into<String>, value: V) -> Result<Arc<V>> {
        let key = key.into();
        let value = self.inner.cache().insert(key.clone(), value)?;
        self.filter.insert(&key)?;
        Ok(value)
    }

    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> Result<Arc<V>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send,
    {
        self.get_or_load_with_ttl(key, self.inner.cache().default_ttl(), loader)
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
        if !self.filter.might_contain(key) {
            return Err(Error::NotFound);
        }
        let value = self.inner.get_or_load_with_ttl(key, ttl, loader).await?;
        self.filter.insert(key)?;
        Ok(value)
    }

    /// Clears the gate. All membership knowledge is lost: every key must be
    /// re-inserted (or re-loaded through a warmed path) to pass again.
    pub fn clear_filter(&self) {
        self.filter.clear();
    }
}
