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

//! Mutual exclusion keyed by string, with expiry and token-guarded
//! ownership.
//!
//! Each key is a tiny state machine: free, or held by a record whose token
//! proves ownership. A record is live iff `now < expires_at` strictly;
//! expired records may be overwritten without an explicit unlock. This is
//! an in-process registry: there is no cross-node coordination.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use burrow_common::{key, singleflight::SingleFlight};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    retry::RetryStrategy,
};

/// Upper bound on lock key length, in bytes.
pub const MAX_KEY_BYTES: usize = 200;

/// Upper bound on lock TTLs.
pub const MAX_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// TTL for [`LockManager::lock_with_defaults`]. Defaults to 30 s.
    pub default_ttl: Duration,
    /// Acquisition timeout for the same. Defaults to 5 s.
    pub default_timeout: Duration,
    /// Retry pacing for the same. Defaults to exponential backoff.
    pub default_retry: RetryStrategy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            default_timeout: Duration::from_secs(5),
            default_retry: RetryStrategy::default(),
        }
    }
}

/// Proof of ownership for one acquisition, bound to `(key, token)`.
///
/// The handle also remembers its TTL: every successful refresh extends the
/// lock by the same amount it was acquired for.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHandle {
    key: String,
    token: Uuid,
    ttl: Duration,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Introspection snapshot of a live lock, without its token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub key: String,
    pub created_at: Instant,
    pub expires_at: Instant,
}

struct LockRecord {
    token: Uuid,
    created_at: Instant,
    expires_at: Instant,
}

struct ManagerInner {
    table: Mutex<HashMap<String, LockRecord>>,
    config: LockConfig,
    flight: SingleFlight<Result<()>>,
}

/// Registry of per-key locks. Cheap clone-able handle; clones share state.
pub struct LockManager {
    inner: Arc<ManagerInner>,
}

impl Clone for LockManager {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("locks", &self.inner.table.lock().len())
            .finish()
    }
}

fn validate_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(Error::invalid_input("lock ttl must be positive"));
    }
    if ttl > MAX_TTL {
        return Err(Error::invalid_input(format!(
            "lock ttl must be at most {MAX_TTL:?}, got {ttl:?}"
        )));
    }
    Ok(())
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_config(LockConfig::default())
    }

    pub fn with_config(config: LockConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                table: Mutex::new(HashMap::new()),
                config,
                flight: SingleFlight::new(),
            }),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    /// Single acquisition attempt. Succeeds when the key is free or its
    /// record has expired; otherwise fails with [`Error::Busy`].
    pub fn try_lock(&self, key: &str, ttl: Duration) -> Result<LockHandle> {
        key::validate(key, MAX_KEY_BYTES)?;
        validate_ttl(ttl)?;

        let now = Instant::now();
        let mut table = self.inner.table.lock();
        if let Some(record) = table.get(key) {
            if now < record.expires_at {
                return Err(Error::Busy);
            }
            trace!(key, "overwriting expired lock");
        }
        let token = Uuid::new_v4();
        table.insert(
            key.to_string(),
            LockRecord {
                token,
                created_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(LockHandle {
            key: key.to_string(),
            token,
            ttl,
        })
    }

    /// Acquires with retries, sleeping between attempts according to
    /// `retry`, until the retry budget is exhausted (`Busy`) or `timeout`
    /// elapses (`Timeout`).
    pub async fn lock(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
        retry: &RetryStrategy,
    ) -> Result<LockHandle> {
        self.lock_inner(key, ttl, timeout, retry, None).await
    }

    /// Like [`LockManager::lock`], aborting promptly with
    /// [`Error::Cancelled`] when `cancel` fires.
    pub async fn lock_with_cancel(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
        retry: &RetryStrategy,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        self.lock_inner(key, ttl, timeout, retry, Some(cancel)).await
    }

    /// Acquires with the manager's configured TTL, timeout, and retry.
    pub async fn lock_with_defaults(&self, key: &str) -> Result<LockHandle> {
        let config = &self.inner.config;
        self.lock(key, config.default_ttl, config.default_timeout, &config.default_retry)
            .await
    }

    async fn lock_inner(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
        retry: &RetryStrategy,
        cancel: Option<&CancellationToken>,
    ) -> Result<LockHandle> {
        if timeout.is_zero() {
            return Err(Error::invalid_input("lock timeout must be positive"));
        }
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(Error::Cancelled);
        }

        let deadline = Instant::now() + timeout;
        match self.try_lock(key, ttl) {
            Ok(handle) => return Ok(handle),
            Err(Error::Busy) => {}
            Err(err) => return Err(err),
        }

        for pause in retry.intervals() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let pause = pause.min(deadline - now);
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                None => tokio::time::sleep(pause).await,
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            match self.try_lock(key, ttl) {
                Ok(handle) => return Ok(handle),
                Err(Error::Busy) => {}
                Err(err) => return Err(err),
            }
        }
        Err(Error::Busy)
    }

    /// Coalesced acquisition: concurrent callers for the same key share one
    /// in-flight attempt. At most one caller gets the handle; the rest see
    /// the shared `Busy`/`Timeout` outcome.
    pub async fn lock_coalesced(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
        retry: &RetryStrategy,
    ) -> Result<LockHandle> {
        let slot: Arc<Mutex<Option<LockHandle>>> = Arc::new(Mutex::new(None));
        let outcome = {
            let manager = self.clone();
            let owned = key.to_string();
            let retry = retry.clone();
            let slot = slot.clone();
            self.inner
                .flight
                .flight(key, move || async move {
                    let handle = manager.lock(&owned, ttl, timeout, &retry).await?;
                    *slot.lock() = Some(handle);
                    Ok(())
                })
                .await
        };
        match outcome {
            // The slot is only filled in the leader's closure, so followers
            // of a successful flight land here empty-handed.
            Ok(()) => slot.lock().take().ok_or(Error::Busy),
            Err(err) => Err(err),
        }
    }

    /// Extends a held lock by the handle's TTL. Fails with
    /// [`Error::NotHeld`] if the record expired or the token does not
    /// match.
    pub fn refresh(&self, handle: &LockHandle) -> Result<()> {
        let now = Instant::now();
        let mut table = self.inner.table.lock();
        match table.get_mut(handle.key()) {
            Some(record) if record.token == handle.token && now < record.expires_at => {
                record.expires_at = now + handle.ttl;
                Ok(())
            }
            _ => Err(Error::NotHeld),
        }
    }

    /// Releases a lock. Only the matching token releases; the transition
    /// happens regardless of expiry, and a mismatch changes nothing.
    pub fn unlock(&self, handle: &LockHandle) -> Result<()> {
        let mut table = self.inner.table.lock();
        match table.get(handle.key()) {
            Some(record) if record.token == handle.token => {
                table.remove(handle.key());
                Ok(())
            }
            _ => Err(Error::NotHeld),
        }
    }

    /// Whether the handle still owns a live lock.
    pub fn is_valid(&self, handle: &LockHandle) -> bool {
        let now = Instant::now();
        let table = self.inner.table.lock();
        table
            .get(handle.key())
            .is_some_and(|record| record.token == handle.token && now < record.expires_at)
    }

    /// Snapshot of the live lock on `key`, if any. Expired records count as
    /// absent.
    pub fn info(&self, key: &str) -> Option<LockInfo> {
        let now = Instant::now();
        let table = self.inner.table.lock();
        table.get(key).and_then(|record| {
            (now < record.expires_at).then(|| LockInfo {
                key: key.to_string(),
                created_at: record.created_at,
                expires_at: record.expires_at,
            })
        })
    }

    /// Starts a background renewal loop: every `period`, one refresh
    /// attempt bounded by `each_timeout`. The loop ends when the refresh
    /// reports [`Error::NotHeld`] (e.g. after an unlock), when the guard is
    /// stopped, or when the guard is dropped.
    pub fn spawn_auto_refresh(
        &self,
        handle: &LockHandle,
        period: Duration,
        each_timeout: Duration,
    ) -> Result<AutoRefresh> {
        if period.is_zero() {
            return Err(Error::invalid_input("auto-refresh period must be positive"));
        }
        if each_timeout.is_zero() {
            return Err(Error::invalid_input("auto-refresh timeout must be positive"));
        }

        let cancel = CancellationToken::new();
        let manager = self.clone();
        let handle = handle.clone();
        let child = cancel.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut tick = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let refresh = tokio::time::timeout(each_timeout, async {
                    manager.refresh(&handle)
                });
                match refresh.await {
                    Ok(Ok(())) => trace!(key = handle.key(), "lock refreshed"),
                    Ok(Err(err)) => {
                        debug!(key = handle.key(), %err, "auto-refresh stopping");
                        break;
                    }
                    Err(_) => warn!(key = handle.key(), "lock refresh timed out"),
                }
            }
        });
        Ok(AutoRefresh {
            task: Some(task),
            cancel,
        })
    }
}

/// Guard over a running auto-refresh loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct AutoRefresh {
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl AutoRefresh {
    /// Signals the loop to stop after the current tick.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the loop and waits for it to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AutoRefresh {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(1);

    #[test]
    fn test_try_lock_and_unlock() {
        let manager = LockManager::new();
        let handle = manager.try_lock("r", TTL).unwrap();
        assert_eq!(manager.try_lock("r", TTL), Err(Error::Busy));
        assert!(manager.is_valid(&handle));

        manager.unlock(&handle).unwrap();
        assert!(!manager.is_valid(&handle));
        manager.try_lock("r", TTL).unwrap();
    }

    #[test]
    fn test_expired_lock_is_overwritten() {
        let manager = LockManager::new();
        let stale = manager.try_lock("r", Duration::from_millis(30)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let fresh = manager.try_lock("r", TTL).unwrap();
        assert_ne!(stale.token(), fresh.token());
        assert!(!manager.is_valid(&stale));
        assert!(manager.is_valid(&fresh));
    }

    #[test]
    fn test_unlock_with_wrong_token_changes_nothing() {
        let manager = LockManager::new();
        let handle = manager.try_lock("r", TTL).unwrap();

        let forged = LockHandle {
            key: "r".to_string(),
            token: Uuid::new_v4(),
            ttl: TTL,
        };
        assert_eq!(manager.unlock(&forged), Err(Error::NotHeld));
        assert!(manager.is_valid(&handle));
    }

    #[test]
    fn test_unlock_released_regardless_of_expiry() {
        let manager = LockManager::new();
        let handle = manager.try_lock("r", Duration::from_millis(20)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        // expired, but the matching token still releases cleanly
        manager.unlock(&handle).unwrap();
        assert!(manager.info("r").is_none());
    }

    #[test]
    fn test_refresh_extends() {
        let manager = LockManager::new();
        let handle = manager.try_lock("r", Duration::from_millis(120)).unwrap();
        std::thread::sleep(Duration::from_millis(70));
        manager.refresh(&handle).unwrap();
        std::thread::sleep(Duration::from_millis(70));
        // without the refresh this would have expired by now
        assert!(manager.is_valid(&handle));
    }

    #[test]
    fn test_refresh_after_expiry() {
        let manager = LockManager::new();
        let handle = manager.try_lock("r", Duration::from_millis(20)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(manager.refresh(&handle), Err(Error::NotHeld));
    }

    #[test]
    fn test_info() {
        let manager = LockManager::new();
        assert!(manager.info("r").is_none());
        manager.try_lock("r", TTL).unwrap();
        let info = manager.info("r").unwrap();
        assert_eq!(info.key, "r");
        assert!(info.expires_at > info.created_at);
    }

    #[test]
    fn test_validation() {
        let manager = LockManager::new();
        assert!(matches!(
            manager.try_lock("r", Duration::ZERO),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            manager.try_lock("r", MAX_TTL + Duration::from_secs(1)),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            manager.try_lock("", TTL),
            Err(Error::InvalidInput(_))
        ));
        let long = "x".repeat(MAX_KEY_BYTES + 1);
        assert!(matches!(
            manager.try_lock(&long, TTL),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_acquires_after_expiry() {
        let manager = LockManager::new();
        let _held = manager.try_lock("r", Duration::from_millis(150)).unwrap();

        let retry = RetryStrategy::fixed(Duration::from_millis(40), 10).unwrap();
        let handle = manager
            .lock("r", TTL, Duration::from_secs(2), &retry)
            .await
            .unwrap();
        assert!(manager.is_valid(&handle));
    }

    #[tokio::test]
    async fn test_lock_times_out() {
        let manager = LockManager::new();
        let _held = manager.try_lock("r", TTL).unwrap();

        let retry = RetryStrategy::fixed(Duration::from_millis(20), 100).unwrap();
        let err = manager
            .lock("r", TTL, Duration::from_millis(100), &retry)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout);
    }

    #[tokio::test]
    async fn test_lock_exhausts_retries_with_busy() {
        let manager = LockManager::new();
        let _held = manager.try_lock("r", TTL).unwrap();

        let retry = RetryStrategy::fixed(Duration::from_millis(10), 2).unwrap();
        let err = manager
            .lock("r", TTL, Duration::from_secs(10), &retry)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Busy);
    }

    #[tokio::test]
    async fn test_lock_cancelled() {
        let manager = LockManager::new();
        let _held = manager.try_lock("r", TTL).unwrap();

        let cancel = CancellationToken::new();
        let retry = RetryStrategy::fixed(Duration::from_millis(50), 100).unwrap();
        let acquiring = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .lock_with_cancel("r", TTL, Duration::from_secs(10), &retry, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        assert_eq!(acquiring.await.unwrap().unwrap_err(), Error::Cancelled);
    }

    #[tokio::test]
    async fn test_coalesced_lock_hands_out_one_handle() {
        let manager = LockManager::new();
        let retry = RetryStrategy::fixed(Duration::from_millis(10), 2).unwrap();

        let handles = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let retry = retry.clone();
                tokio::spawn(async move {
                    manager
                        .lock_coalesced("r", TTL, Duration::from_secs(1), &retry)
                        .await
                })
            })
            .collect::<Vec<_>>();

        let mut acquired = 0;
        for task in handles {
            match task.await.unwrap() {
                Ok(handle) => {
                    acquired += 1;
                    assert!(manager.is_valid(&handle));
                }
                Err(err) => assert!(matches!(err, Error::Busy | Error::Timeout)),
            }
        }
        assert_eq!(acquired, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_auto_refresh_keeps_lock_alive() {
        let manager = LockManager::new();
        let handle = manager.try_lock("r", Duration::from_millis(200)).unwrap();
        let refresher = manager
            .spawn_auto_refresh(&handle, Duration::from_millis(50), Duration::from_millis(50))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(manager.is_valid(&handle));

        // unlock makes the next refresh fail, ending the loop on its own
        manager.unlock(&handle).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(refresher.is_finished());
    }

    #[test_log::test(tokio::test)]
    async fn test_auto_refresh_stop() {
        let manager = LockManager::new();
        let handle = manager.try_lock("r", Duration::from_millis(100)).unwrap();
        let refresher = manager
            .spawn_auto_refresh(&handle, Duration::from_millis(30), Duration::from_millis(30))
            .unwrap();

        refresher.shutdown().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        // with nothing refreshing it, the lock lapses
        assert!(!manager.is_valid(&handle));
    }
}
