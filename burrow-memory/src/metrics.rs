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

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Metrics {
    pub hit: AtomicU64,
    pub miss: AtomicU64,
    pub insert: AtomicU64,
    pub replace: AtomicU64,
    pub remove: AtomicU64,
    pub eviction: AtomicU64,
    pub expiration: AtomicU64,
}

/// Point-in-time counter snapshot plus live usage, as returned by
/// [`crate::Cache::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub replaces: u64,
    pub removes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub used_bytes: usize,
    pub count: usize,
}

impl Metrics {
    pub fn snapshot(&self, used_bytes: usize, count: usize) -> Stats {
        Stats {
            hits: self.hit.load(Ordering::Relaxed),
            misses: self.miss.load(Ordering::Relaxed),
            inserts: self.insert.load(Ordering::Relaxed),
            replaces: self.replace.load(Ordering::Relaxed),
            removes: self.remove.load(Ordering::Relaxed),
            evictions: self.eviction.load(Ordering::Relaxed),
            expirations: self.expiration.load(Ordering::Relaxed),
            used_bytes,
            count,
        }
    }
}
