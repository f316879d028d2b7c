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

//! Keyed request coalescing.
//!
//! At most one computation per key is in flight at a time. The first caller
//! becomes the leader and runs the computation; concurrent callers for the
//! same key wait on a oneshot channel and receive a clone of the leader's
//! result. Results are never cached across calls: once the flight lands, the
//! next caller starts a fresh one.

use std::future::Future;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

pub struct SingleFlight<T> {
    flights: Mutex<HashMap<String, Vec<oneshot::Sender<T>>>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.flights.lock().len())
            .finish()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `make()` under the key, coalescing with any in-flight call.
    ///
    /// The leader's result is broadcast to every waiter, success or failure
    /// alike. If the leader is dropped mid-flight, one of the waiters takes
    /// over as the new leader and re-runs the computation.
    pub async fn flight<F, Fut>(&self, key: &str, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(value) = self.wait(key).await {
            return value;
        }

        // Leader path. The guard tears the flight down if this future is
        // dropped before landing, which wakes the waiters up to retry.
        let mut guard = FlightGuard {
            flights: &self.flights,
            key,
            armed: true,
        };
        let value = make().await;
        self.land(key, value.clone());
        guard.armed = false;
        value
    }

    /// Number of flights currently in the air.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    /// Joins an existing flight as a waiter, or registers a new one and
    /// returns `None` to signal that the caller is now the leader.
    async fn wait(&self, key: &str) -> Option<T> {
        loop {
            let rx = {
                let mut flights = self.flights.lock();
                match flights.get_mut(key) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        flights.insert(key.to_string(), vec![]);
                        None
                    }
                }
            };
            match rx {
                Some(rx) => match rx.await {
                    Ok(value) => return Some(value),
                    // The leader was dropped; race to take over.
                    Err(_) => continue,
                },
                None => return None,
            }
        }
    }

    fn land(&self, key: &str, value: T) {
        let waiters = self.flights.lock().remove(key).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(value.clone());
        }
    }
}

struct FlightGuard<'a, T> {
    flights: &'a Mutex<HashMap<String, Vec<oneshot::Sender<T>>>>,
    key: &'a str,
    armed: bool,
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            // Dropping the senders errors the waiters out of `rx.await`.
            drop(self.flights.lock().remove(self.key));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_coalesce() {
        let flight = Arc::new(SingleFlight::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles = (0..16)
            .map(|_| {
                let flight = flight.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    flight
                        .flight("answer", || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            42
                        })
                        .await
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_no_memoisation() {
        let flight = SingleFlight::<u64>::new();
        let calls = AtomicUsize::new(0);

        for expected in 1..=3 {
            let value = flight
                .flight("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst) as u64 + 1
                })
                .await;
            assert_eq!(value, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_distinct_keys_fly_separately() {
        let flight = Arc::new(SingleFlight::<String>::new());

        let a = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .flight("a", || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        "a".to_string()
                    })
                    .await
            })
        };
        let b = flight.flight("b", || async { "b".to_string() }).await;

        assert_eq!(b, "b");
        assert_eq!(a.await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_leader_dropped_waiter_takes_over() {
        let flight = Arc::new(SingleFlight::<u64>::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .flight("k", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.flight("k", || async { 2 }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        assert_eq!(waiter.await.unwrap(), 2);
        assert_eq!(flight.in_flight(), 0);
    }
}
