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

pub mod fifo;
pub mod lru;

use serde::{Deserialize, Serialize};

use crate::eviction::{fifo::Fifo, lru::Lru};

/// Ordering discipline over the live cache keys.
///
/// The policy only orders keys and picks victims. It never expires entries
/// on its own, and the entry map remains the authoritative key set: the
/// cache keeps the two in lockstep.
pub trait Policy: Send + 'static {
    /// Records that `key` was just used, inserting it if absent.
    fn touch(&mut self, key: &str);

    /// Returns and removes the victim, if any.
    fn evict(&mut self) -> Option<String>;

    /// Removes `key` from the ordering. Returns whether it was present.
    fn remove(&mut self, key: &str) -> bool;

    fn contains(&self, key: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvictionConfig {
    #[default]
    Lru,
    Fifo,
}

impl EvictionConfig {
    pub(crate) fn build(self) -> Box<dyn Policy> {
        match self {
            Self::Lru => Box::new(Lru::new()),
            Self::Fifo => Box::new(Fifo::new()),
        }
    }
}
