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

use std::{collections::HashMap as StdHashMap, sync::Arc};

use burrow_common::{key, singleflight::SingleFlight};
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Upper bound on routed key length, in bytes.
pub const MAX_KEY_BYTES: usize = 500;

/// Upper bound on peer id length, in bytes.
pub const MAX_PEER_ID_BYTES: usize = 250;

const DEFAULT_REPLICAS: usize = 150;
const MAX_REPLICAS: usize = 1000;

/// 32-bit hash over the key bytes. Defaults to CRC32-IEEE.
pub type HashFn = Arc<dyn Fn(&[u8]) -> u32 + Send + Sync + 'static>;

/// A physical peer registered on the ring. `weight` and `alive` are
/// registry metadata for callers; routing is by virtual nodes only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub addr: String,
    pub weight: u32,
    pub alive: bool,
}

impl Peer {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            weight: 100,
            alive: true,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Per-ring counters, see [`HashRing::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingStats {
    pub replicas: usize,
    pub peer_count: usize,
    /// Virtual-node count per peer id.
    pub virtual_nodes: StdHashMap<String, usize>,
}

/// Population variance of externally-sampled per-peer key counts. Lower is
/// better balanced.
pub fn load_variance(counts: &[usize]) -> f64 {
    if counts.is_empty() {
        return 0.0;
    }
    let mean = counts.iter().sum::<usize>() as f64 / counts.len() as f64;
    counts
        .iter()
        .map(|&count| {
            let diff = count as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / counts.len() as f64
}

struct RingState {
    /// Sorted ascending by `(hash, id)` and treated as circular.
    ring: Vec<(u32, Arc<str>)>,
    peers: HashMap<Arc<str>, Peer>,
}

struct RingInner {
    replicas: usize,
    hash_fn: HashFn,
    state: RwLock<RingState>,
    flight: Option<SingleFlight<Result<Peer>>>,
}

/// Consistent-hash ring with virtual-node replication.
///
/// Readers never block each other; peer mutations briefly exclude readers
/// and leave the ring fully sorted. `HashRing` is a cheap clone-able
/// handle.
pub struct HashRing {
    inner: Arc<RingInner>,
}

impl Clone for HashRing {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("HashRing")
            .field("replicas", &self.inner.replicas)
            .field("peers", &state.peers.len())
            .field("virtual_nodes", &state.ring.len())
            .finish()
    }
}

impl HashRing {
    pub fn builder() -> HashRingBuilder {
        HashRingBuilder::new()
    }

    /// Registers peers. Each new peer contributes `replicas` virtual nodes
    /// hashed from `"{id}#{i}"`. Re-adding a known id replaces its registry
    /// entry and leaves the ring untouched, so the call is idempotent.
    pub fn add_peers(&self, peers: impl IntoIterator<Item = Peer>) -> Result<()> {
        let peers = peers.into_iter().collect::<Vec<_>>();
        for peer in &peers {
            key::validate(&peer.id, MAX_PEER_ID_BYTES)
                .map_err(|err| Error::invalid_input(format!("peer id: {err}")))?;
        }

        let mut state = self.inner.state.write();
        for peer in peers {
            let id: Arc<str> = peer.id.as_str().into();
            if state.peers.insert(id.clone(), peer).is_some() {
                continue;
            }
            for i in 0..self.inner.replicas {
                let hash = (self.inner.hash_fn)(format!("{id}#{i}").as_bytes());
                state.ring.push((hash, id.clone()));
            }
            debug!(id = %id, "peer joined the ring");
        }
        state.ring.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(())
    }

    /// Unregisters peers, removing exactly their virtual nodes. Unknown ids
    /// are ignored.
    pub fn remove_peers<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        let ids = ids.into_iter().collect::<HashSet<_>>();
        let mut state = self.inner.state.write();
        state.ring.retain(|(_, id)| !ids.contains(id.as_ref()));
        for id in ids {
            if state.peers.remove(id).is_some() {
                debug!(id, "peer left the ring");
            }
        }
    }

    /// Routes `key` to its peer: the first virtual node clockwise from the
    /// key's hash.
    pub fn get(&self, key: &str) -> Result<Peer> {
        key::validate(key, MAX_KEY_BYTES)?;
        let state = self.inner.state.read();
        if state.ring.is_empty() {
            return Err(Error::NoPeers);
        }
        let hash = (self.inner.hash_fn)(key.as_bytes());
        let index = state.ring.partition_point(|(h, _)| *h < hash);
        let index = if index == state.ring.len() { 0 } else { index };
        let (_, id) = &state.ring[index];
        state.peers.get(id).cloned().ok_or(Error::NoPeers)
    }

    /// Like [`HashRing::get`], but concurrent lookups of the same key share
    /// one computation when coalescing is enabled.
    pub async fn get_coalesced(&self, key: &str) -> Result<Peer> {
        match &self.inner.flight {
            Some(flight) => {
                let ring = self.clone();
                let owned = key.to_string();
                flight.flight(key, move || async move { ring.get(&owned) }).await
            }
            None => self.get(key),
        }
    }

    /// Routes `key` to up to `n` distinct peers, walking the ring clockwise
    /// from the key's position.
    pub fn get_n(&self, key: &str, n: usize) -> Result<Vec<Peer>> {
        key::validate(key, MAX_KEY_BYTES)?;
        let state = self.inner.state.read();
        if state.ring.is_empty() {
            return Err(Error::NoPeers);
        }
        let hash = (self.inner.hash_fn)(key.as_bytes());
        let start = state.ring.partition_point(|(h, _)| *h < hash);

        let mut seen = HashSet::new();
        let mut picked = Vec::new();
        for offset in 0..state.ring.len() {
            if picked.len() == n {
                break;
            }
            let (_, id) = &state.ring[(start + offset) % state.ring.len()];
            if seen.insert(id.clone()) {
                if let Some(peer) = state.peers.get(id) {
                    picked.push(peer.clone());
                }
            }
        }
        Ok(picked)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.state.read().peers.values().cloned().collect()
    }

    pub fn contains_peer(&self, id: &str) -> bool {
        self.inner.state.read().peers.contains_key(id)
    }

    /// Number of virtual nodes on the ring.
    pub fn len(&self) -> usize {
        self.inner.state.read().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RingStats {
        let state = self.inner.state.read();
        let mut virtual_nodes: StdHashMap<String, usize> = StdHashMap::new();
        for (_, id) in &state.ring {
            *virtual_nodes.entry(id.to_string()).or_default() += 1;
        }
        RingStats {
            replicas: self.inner.replicas,
            peer_count: state.peers.len(),
            virtual_nodes,
        }
    }
}

/// Builder for [`HashRing`].
pub struct HashRingBuilder {
    replicas: usize,
    hash_fn: HashFn,
    coalesce: bool,
}

impl Default for HashRingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HashRingBuilder {
    pub fn new() -> Self {
        Self {
            replicas: DEFAULT_REPLICAS,
            hash_fn: Arc::new(crc32fast::hash),
            coalesce: true,
        }
    }

    /// Virtual nodes per peer, in `1..=1000`. Defaults to 150.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_hash_fn(mut self, hash_fn: impl Fn(&[u8]) -> u32 + Send + Sync + 'static) -> Self {
        self.hash_fn = Arc::new(hash_fn);
        self
    }

    pub fn with_coalescing(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn build(self) -> Result<HashRing> {
        if self.replicas == 0 || self.replicas > MAX_REPLICAS {
            return Err(Error::invalid_input(format!(
                "replicas must be in 1..={MAX_REPLICAS}, got {}",
                self.replicas
            )));
        }
        Ok(HashRing {
            inner: Arc::new(RingInner {
                replicas: self.replicas,
                hash_fn: self.hash_fn,
                state: RwLock::new(RingState {
                    ring: vec![],
                    peers: HashMap::new(),
                }),
                flight: self.coalesce.then(SingleFlight::new),
            }),
        })
    }
}
