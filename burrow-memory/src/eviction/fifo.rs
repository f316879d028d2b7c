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

use burrow_common::queue::{RemovableQueue, Token};
use hashbrown::HashMap;

use crate::eviction::Policy;

/// First-in-first-out ordering: reuse does not change a key's position.
pub struct Fifo {
    queue: RemovableQueue<String>,
    tokens: HashMap<String, Token>,
}

impl Default for Fifo {
    fn default() -> Self {
        Self::new()
    }
}

impl Fifo {
    pub fn new() -> Self {
        Self {
            queue: RemovableQueue::new(),
            tokens: HashMap::new(),
        }
    }
}

impl Policy for Fifo {
    fn touch(&mut self, key: &str) {
        if self.tokens.contains_key(key) {
            return;
        }
        let token = self.queue.push(key.to_string());
        self.tokens.insert(key.to_string(), token);
    }

    fn evict(&mut self) -> Option<String> {
        let key = self.queue.pop()?;
        self.tokens.remove(&key);
        Some(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.tokens.remove(key) {
            Some(token) => self.queue.remove(token).is_some(),
            None => false,
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.tokens.contains_key(key)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.tokens.clear();
    }
}
