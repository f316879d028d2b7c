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

//! Bounded in-memory cache with TTL expiry, LRU/FIFO eviction, memory
//! accounting, and composable access patterns.

pub mod bloom;
pub mod cache;
pub mod error;
pub mod eviction;
pub mod listener;
pub mod metrics;
pub mod pattern;

pub use crate::{
    bloom::{BloomFilter, BloomGatedCache},
    cache::{Cache, CacheBuilder, Weighter},
    error::{Error, Result},
    eviction::EvictionConfig,
    listener::{DefaultEvictionListener, EvictReason, EvictionListener},
    metrics::Stats,
    pattern::{
        read_through::ReadThroughCache,
        write_back::{WriteBackCache, WriteBackConfig},
        write_through::WriteThroughCache,
        StoreWriter,
    },
};
