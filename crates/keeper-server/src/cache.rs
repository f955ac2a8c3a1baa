//! Claim-then-fetch result cache
//!
//! Callers coordinate an expensive external lookup per key:
//!
//! 1. [`ResultCache::check`] returns `false` to exactly one caller, which
//!    becomes responsible for fetching and calling [`ResultCache::store`].
//! 2. Everyone else calls [`ResultCache::get`] and waits for the stored value.
//!
//! A getter that waits out the whole budget releases the claim, so the next
//! `check` hands the fetch to someone else instead of leaving the key stuck.
//! Claims carry a generation: a getter only releases the claim it started
//! waiting on, never one taken by a later `check`.
//!
//! ```text
//! caller A: check("R1") = false ──► fetch ──► store("R1", v)
//!                                                  │
//! caller B: check("R1") = true ──► get("R1") ◄─────┘ (woken by broadcast)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CacheConfig;

pub struct ResultCache<V> {
    /// key -> generation of the outstanding claim; absent when released
    claims: RwLock<HashMap<String, u64>>,
    next_generation: AtomicU64,
    values: RwLock<HashMap<String, V>>,
    waiters: Mutex<HashMap<String, broadcast::Sender<V>>>,
    wait_budget: Duration,
}

impl<V> ResultCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_wait_budget(config.wait_budget())
    }

    pub fn with_wait_budget(wait_budget: Duration) -> Self {
        Self {
            claims: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            values: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            wait_budget,
        }
    }

    /// Claim `name` for fetching.
    ///
    /// Returns `false` exactly once per claim: the caller that sees it must
    /// fetch and [`store`](Self::store). Every other caller sees `true`.
    pub fn check(&self, name: &str) -> bool {
        if self.claim(name).is_some() {
            return true;
        }

        let mut claims = self.claims.write().unwrap_or_else(PoisonError::into_inner);
        if claims.contains_key(name) {
            return true;
        }
        let generation = self.generation();
        claims.insert(name.to_string(), generation);
        debug!(name, generation, "Claimed cache entry");
        false
    }

    fn claim(&self, name: &str) -> Option<u64> {
        self.claims
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Store the fetched value and wake every waiting getter.
    pub fn store(&self, name: &str, data: V) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), data.clone());
        self.claims
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| self.generation());

        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(tx) = waiter {
            debug!(name, waiters = tx.receiver_count(), "Waking cache waiters");
            // No receivers left is fine
            let _ = tx.send(data);
        }
    }

    /// Current value of `name` without waiting.
    pub fn peek(&self, name: &str) -> Option<V> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Wait up to the wait budget for `name` to be stored.
    ///
    /// Returns `None` when `cancel` fires or the budget runs out; only the
    /// latter releases the claim, and only if it is still the one that was
    /// outstanding when the wait began.
    pub async fn get(&self, cancel: &CancellationToken, name: &str) -> Option<V> {
        if let Some(value) = self.peek(name) {
            return Some(value);
        }

        // Subscribe, then look again, so a store in between is not missed
        let mut rx = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(1).0)
            .subscribe();
        let awaited = self.claim(name);

        // Outer None: cancelled. Inner None: nothing arrived in time.
        let outcome = match self.peek(name) {
            Some(value) => Some(Some(value)),
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                received = tokio::time::timeout(self.wait_budget, rx.recv()) => {
                    Some(received.ok().and_then(|r| r.ok()))
                }
            },
        };
        drop(rx);
        self.release_waiter(name);

        match outcome {
            None => None,
            Some(Some(value)) => Some(value),
            Some(None) => self.expire(name, awaited),
        }
    }

    fn release_waiter(&self, name: &str) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        if waiters.get(name).is_some_and(|tx| tx.receiver_count() == 0) {
            waiters.remove(name);
        }
    }

    /// Budget exhausted: release the `awaited` claim unless a value landed
    /// meanwhile or the claim has since been replaced.
    fn expire(&self, name: &str, awaited: Option<u64>) -> Option<V> {
        if let Some(value) = self.peek(name) {
            return Some(value);
        }

        let mut claims = self.claims.write().unwrap_or_else(PoisonError::into_inner);
        match awaited {
            Some(generation) if claims.get(name) == Some(&generation) => {
                claims.remove(name);
                warn!(name, budget = ?self.wait_budget, "Cached value never arrived, claim released");
            }
            _ => debug!(name, "Cached value never arrived, claim already replaced"),
        }
        None
    }

    /// Drop the value and claim of `name`.
    pub fn evict(&self, name: &str) -> Option<V> {
        self.claims
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn len(&self) -> usize {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
