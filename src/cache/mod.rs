// src/cache/mod.rs
//! TTL cache of aggregates keyed by (site_id, date) with a single build per
//! key in flight.
//!
//! Store failures never surface: reads degrade to a miss and writes to a
//! logged no-op, so a broken store only costs extra provider fetches.

pub mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{CacheError, CoordinatorError};
use crate::types::AggregateResult;
pub use store::{CacheEntry, CacheKey, CacheStore, FileStore, MemoryStore};

/// What a builder hands back to `get_or_build`.
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    /// Complete result, cached and shared with waiters.
    Fresh(AggregateResult),
    /// Cut short by shutdown. Returned to the builder's caller only; never
    /// cached, and waiters retry instead of inheriting it.
    Interrupted(AggregateResult),
}

type Shared = Option<Result<AggregateResult, CoordinatorError>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub degraded: u64,
}

enum Claim {
    Lead(watch::Sender<Shared>),
    Wait(watch::Receiver<Shared>),
}

/// Removes the in-flight marker when the leader finishes or is dropped.
///
/// The leader calls [`release`](Self::release) before broadcasting, so a
/// woken waiter that retries can never find the finished channel again.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<CacheKey, watch::Receiver<Shared>>>,
    key: CacheKey,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn release(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let mut map = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.remove(&self.key);
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    in_flight: Mutex<HashMap<CacheKey, watch::Receiver<Shared>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    degraded: AtomicU64,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Cached aggregate for `(site_id, date)` if present and unexpired.
    pub async fn get(&self, site_id: &str, date: NaiveDate) -> Option<AggregateResult> {
        let key = CacheKey::new(site_id, date);
        match self.lookup(&key).await {
            Some(r) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("cache_hits_total").increment(1);
                debug!(target: "cache", key = %key, "cache hit");
                Some(r)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Store `result` for `ttl`. Store failures are logged and swallowed.
    pub async fn put(&self, site_id: &str, date: NaiveDate, result: AggregateResult, ttl: Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let key = CacheKey::new(site_id, date);
        let entry = CacheEntry {
            key: key.clone(),
            result,
            expires_at: Utc::now() + ttl,
        };
        if let Err(e) = self.store.put(entry).await {
            self.degrade(&key, "put", &e);
        }
    }

    pub async fn invalidate(&self, site_id: &str, date: NaiveDate) {
        let key = CacheKey::new(site_id, date);
        if let Err(e) = self.store.remove(&key).await {
            self.degrade(&key, "remove", &e);
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.store.clear().await {
            self.degraded.fetch_add(1, Ordering::Relaxed);
            counter!("cache_degraded_total").increment(1);
            warn!(target: "cache", store = self.store.name(), error = %e, "cache clear failed");
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }

    /// Return the cached aggregate, or build it exactly once across all
    /// concurrent callers for the same key.
    ///
    /// If the build fails or its caller goes away, each waiter retries once,
    /// possibly becoming the builder itself.
    pub async fn get_or_build<F, Fut>(
        &self,
        site_id: &str,
        date: NaiveDate,
        ttl: Duration,
        builder: F,
    ) -> Result<AggregateResult, CoordinatorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BuildOutcome, CoordinatorError>>,
    {
        self.get_or_build_until(site_id, date, ttl, std::future::pending(), builder)
            .await
    }

    /// Like [`get_or_build`](Self::get_or_build), but a caller parked on
    /// someone else's build gives up with `Cancelled` once `abandon` resolves.
    /// The builder is expected to observe its own stop signal.
    pub async fn get_or_build_until<A, F, Fut>(
        &self,
        site_id: &str,
        date: NaiveDate,
        ttl: Duration,
        abandon: A,
        builder: F,
    ) -> Result<AggregateResult, CoordinatorError>
    where
        A: Future<Output = ()>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BuildOutcome, CoordinatorError>>,
    {
        tokio::pin!(abandon);
        let key = CacheKey::new(site_id, date);
        let mut builder = Some(builder);
        let mut last_err = None;

        for round in 0..2 {
            if let Some(hit) = self.get(site_id, date).await {
                return Ok(hit);
            }

            match self.claim(&key) {
                Claim::Lead(tx) => {
                    let mut guard = InFlightGuard {
                        in_flight: &self.in_flight,
                        key: key.clone(),
                        armed: true,
                    };
                    // Another leader may have finished between our miss and our claim.
                    if let Some(hit) = self.lookup(&key).await {
                        guard.release();
                        tx.send_replace(Some(Ok(hit.clone())));
                        return Ok(hit);
                    }
                    let build = builder.take().ok_or_else(|| {
                        CoordinatorError::Internal(format!("builder for {key} consumed twice"))
                    })?;

                    self.builds.fetch_add(1, Ordering::Relaxed);
                    counter!("cache_builds_total").increment(1);
                    debug!(target: "cache", key = %key, round, "building aggregate");

                    return match build().await {
                        Ok(BuildOutcome::Fresh(result)) => {
                            self.put(site_id, date, result.clone(), ttl).await;
                            guard.release();
                            tx.send_replace(Some(Ok(result.clone())));
                            Ok(result)
                        }
                        Ok(BuildOutcome::Interrupted(result)) => {
                            guard.release();
                            tx.send_replace(Some(Err(CoordinatorError::Internal(format!(
                                "build for {key} was interrupted"
                            )))));
                            Ok(result)
                        }
                        Err(e) => {
                            guard.release();
                            tx.send_replace(Some(Err(e.clone())));
                            Err(e)
                        }
                    };
                }
                Claim::Wait(mut rx) => {
                    debug!(target: "cache", key = %key, round, "waiting for in-flight build");
                    let shared = tokio::select! {
                        r = rx.wait_for(|v| v.is_some()) => r.map(|v| (*v).clone()),
                        _ = &mut abandon => {
                            debug!(target: "cache", key = %key, "caller left before in-flight build finished");
                            return Err(CoordinatorError::Cancelled(format!(
                                "stopped waiting for in-flight build of {key}"
                            )));
                        }
                    };
                    match shared {
                        Ok(Some(Ok(result))) => return Ok(result),
                        Ok(Some(Err(e))) => {
                            warn!(target: "cache", key = %key, error = %e, "in-flight build failed");
                            last_err = Some(e);
                        }
                        Ok(None) | Err(_) => {
                            warn!(target: "cache", key = %key, "in-flight build abandoned");
                            last_err = Some(CoordinatorError::Internal(format!(
                                "build for {key} was abandoned"
                            )));
                        }
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CoordinatorError::Internal(format!("no result for {key}"))))
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, watch::Receiver<Shared>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, key: &CacheKey) -> Claim {
        let mut map = self.lock_in_flight();
        if let Some(rx) = map.get(key) {
            return Claim::Wait(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        map.insert(key.clone(), rx);
        Claim::Lead(tx)
    }

    /// Store read without hit/miss accounting. Expired entries read as absent.
    async fn lookup(&self, key: &CacheKey) -> Option<AggregateResult> {
        match self.store.get(key).await {
            Ok(Some(entry)) if !entry.is_expired_at(Utc::now()) => Some(entry.result),
            Ok(Some(_)) => {
                if let Err(e) = self.store.remove(key).await {
                    self.degrade(key, "remove", &e);
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                self.degrade(key, "get", &e);
                None
            }
        }
    }

    fn degrade(&self, key: &CacheKey, op: &'static str, e: &CacheError) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        counter!("cache_degraded_total").increment(1);
        warn!(
            target: "cache",
            store = self.store.name(),
            key = %key,
            op,
            error = %e,
            "cache store degraded"
        );
    }
}
