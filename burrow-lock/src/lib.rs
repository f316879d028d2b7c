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

//! In-process distributed-lock manager with expiry, renewal, and retries.

pub mod error;
pub mod manager;
pub mod retry;

pub use crate::{
    error::{Error, Result},
    manager::{AutoRefresh, LockConfig, LockHandle, LockInfo, LockManager},
    retry::{Intervals, RetryStrategy},
};
