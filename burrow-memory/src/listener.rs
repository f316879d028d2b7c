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

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Why an entry left the cache without an explicit removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictReason {
    /// Dropped by the eviction policy to make room.
    Evicted,
    /// Past its TTL, dropped on access or by the sweeper.
    Expired,
    /// Overwritten by an insert on the same key.
    Replaced,
}

/// Trait for the customized eviction listener.
///
/// The listener is invoked for every removal that is not an explicit
/// `remove`/`take`, strictly after the cache lock is released, so it may
/// call back into the cache without deadlocking.
pub trait EvictionListener<V>: Send + Sync + 'static {
    fn on_evict(&self, key: &str, value: Arc<V>, reason: EvictReason);
}

/// Listener that drops the events.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvictionListener;

impl<V> EvictionListener<V> for DefaultEvictionListener {
    fn on_evict(&self, _: &str, _: Arc<V>, _: EvictReason) {}
}

impl<V, F> EvictionListener<V> for F
where
    F: Fn(&str, Arc<V>, EvictReason) + Send + Sync + 'static,
{
    fn on_evict(&self, key: &str, value: Arc<V>, reason: EvictReason) {
        (self)(key, value, reason)
    }
}
