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

//! Access-pattern wrappers over [`crate::Cache`].
//!
//! Each wrapper keeps the cache surface and composes it with a
//! user-supplied side effect: loading on miss (read-through), writing
//! before insert (write-through), or deferring writes into batches
//! (write-back).

pub mod read_through;
pub mod write_back;
pub mod write_through;

use std::future::Future;

/// Downstream store hook used by write-through and write-back.
///
/// Implemented for any `Fn(&str, &V) -> Future` closure that clones what it
/// needs before constructing the future.
pub trait StoreWriter<V>: Send + Sync + 'static {
    fn write(&self, key: &str, value: &V) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl<V, F, Fut> StoreWriter<V> for F
where
    F: Fn(&str, &V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn write(&self, key: &str, value: &V) -> impl Future<Output = anyhow::Result<()>> + Send {
        (self)(key, value)
    }
}
