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

//! burrow is a toolkit of in-process building blocks for distributed
//! caching systems:
//!
//! - [`Cache`] and its access-pattern wrappers — a bounded in-memory cache
//!   with LRU/FIFO eviction, TTL expiry, memory accounting, read-through,
//!   write-through, write-back, and a Bloom-filter gate.
//! - [`HashRing`] — a consistent-hash ring with virtual-node replication
//!   and coalesced lookups.
//! - [`LockManager`] — an in-process lock registry with expiry, renewal,
//!   and retry strategies.
//!
//! Each engine lives in its own crate (`burrow-memory`, `burrow-ring`,
//! `burrow-lock`); this crate re-exports the public surface. Per-engine
//! error types stay under the [`memory`], [`ring`], and [`lock`] modules.

pub use burrow_common as common;
pub use burrow_lock as lock;
pub use burrow_memory as memory;
pub use burrow_ring as ring;

pub use burrow_lock::{AutoRefresh, LockConfig, LockHandle, LockInfo, LockManager, RetryStrategy};
pub use burrow_memory::{
    BloomFilter, BloomGatedCache, Cache, CacheBuilder, DefaultEvictionListener, EvictReason,
    EvictionConfig, EvictionListener, ReadThroughCache, Stats, StoreWriter, WriteBackCache,
    WriteBackConfig, WriteThroughCache,
};
pub use burrow_ring::{load_variance, HashRing, HashRingBuilder, Peer, RingStats};
