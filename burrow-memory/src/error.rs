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

use burrow_common::key::KeyError;
use thiserror::Error;

/// Cache error. `Clone` so that coalesced waiters can share one outcome.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("key not found")]
    NotFound,
    #[error("loader failed: {0}")]
    Loader(Arc<anyhow::Error>),
    #[error("writer failed: {0}")]
    Writer(Arc<anyhow::Error>),
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn loader(err: anyhow::Error) -> Self {
        Self::Loader(Arc::new(err))
    }

    pub fn writer(err: anyhow::Error) -> Self {
        Self::Writer(Arc::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<KeyError> for Error {
    fn from(err: KeyError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
