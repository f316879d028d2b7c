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

//! Retry pacing for lock acquisition.
//!
//! A strategy is a restartable factory: every [`RetryStrategy::intervals`]
//! call yields a fresh, finite sequence of sleep durations, so concurrent
//! acquisitions never share iterator state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// `base, base, ...` — `attempts` times.
    Fixed { interval: Duration, attempts: usize },
    /// `base, base*factor, base*factor^2, ...` — `attempts` times.
    Exponential {
        base: Duration,
        factor: u32,
        attempts: usize,
    },
    /// `base, base+step, base+2*step, ...` — `attempts` times.
    Linear {
        base: Duration,
        step: Duration,
        attempts: usize,
    },
}

impl Default for RetryStrategy {
    /// Exponential backoff, 100 ms base, doubling, 3 attempts.
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(100),
            factor: 2,
            attempts: 3,
        }
    }
}

impl RetryStrategy {
    pub fn fixed(interval: Duration, attempts: usize) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::invalid_input("retry interval must be positive"));
        }
        Ok(Self::Fixed { interval, attempts })
    }

    pub fn exponential(base: Duration, factor: u32, attempts: usize) -> Result<Self> {
        if base.is_zero() {
            return Err(Error::invalid_input("retry base must be positive"));
        }
        if factor == 0 {
            return Err(Error::invalid_input("retry factor must be positive"));
        }
        Ok(Self::Exponential {
            base,
            factor,
            attempts,
        })
    }

    pub fn linear(base: Duration, step: Duration, attempts: usize) -> Result<Self> {
        if base.is_zero() {
            return Err(Error::invalid_input("retry base must be positive"));
        }
        Ok(Self::Linear {
            base,
            step,
            attempts,
        })
    }

    /// Hard cap on retry attempts after the initial try.
    pub fn attempts(&self) -> usize {
        match self {
            Self::Fixed { attempts, .. }
            | Self::Exponential { attempts, .. }
            | Self::Linear { attempts, .. } => *attempts,
        }
    }

    /// A fresh interval sequence for one acquisition.
    pub fn intervals(&self) -> Intervals {
        Intervals {
            strategy: self.clone(),
            index: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Intervals {
    strategy: RetryStrategy,
    index: usize,
}

impl Iterator for Intervals {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.index >= self.strategy.attempts() {
            return None;
        }
        let pause = match self.strategy {
            RetryStrategy::Fixed { interval, .. } => interval,
            RetryStrategy::Exponential { base, factor, .. } => {
                let scale = factor.checked_pow(self.index as u32).unwrap_or(u32::MAX);
                base.saturating_mul(scale)
            }
            RetryStrategy::Linear { base, step, .. } => {
                base.saturating_add(step.saturating_mul(self.index as u32))
            }
        };
        self.index += 1;
        Some(pause)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.strategy.attempts() - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Intervals {}
