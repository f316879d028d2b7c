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

//! Key validation shared by the burrow engines.
//!
//! Every engine addresses entries by printable string keys. The byte limit
//! differs per engine (cache, ring, lock, bloom), so the limit is an
//! argument here and a constant at each call site.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,
    #[error("key exceeds {limit} bytes (got {len})")]
    TooLong { limit: usize, len: usize },
    #[error("key contains control byte {byte:#04x}")]
    ControlByte { byte: u8 },
}

/// Validates a key against the engine's byte limit.
///
/// A valid key is non-empty, at most `limit` bytes, and free of ASCII
/// control bytes (which rules out newlines and NULs).
pub fn validate(key: &str, limit: usize) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    if key.len() > limit {
        return Err(KeyError::TooLong {
            limit,
            len: key.len(),
        });
    }
    if let Some(byte) = key.bytes().find(u8::is_ascii_control) {
        return Err(KeyError::ControlByte { byte });
    }
    Ok(())
}
