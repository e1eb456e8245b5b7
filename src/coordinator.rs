// src/coordinator.rs
//! Job coordinator: one run = resolve site → fan out one branch per provider
//! on the shared pool → transform + score in each branch → merge → cache.
//!
//! A provider failure is never an error of the run. Only an unknown or
//! disabled site and internal defects (a branch panicking, a merge that breaks
//! its own guarantees) come back as `CoordinatorError`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use metrics::{counter, gauge};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregate::{merge, validate_branches, ProviderBranch};
use crate::cache::{BuildOutcome, CacheManager, CacheStore, FileStore, MemoryStore};
use crate::config::{AppConfig, CacheBackend};
use crate::error::{ConfigError, CoordinatorError};
use crate::fetch::{ProviderFetcher, ProviderTransport, RetryPolicy};
use crate::scoring::{Scorer, ScoringWeights};
use crate::sites::{ProviderDecl, SiteConfig, SiteRegistry, SiteRegistryHandle};
use crate::transform::TransformerRegistry;
use crate::types::{AggregateResult, FetchOutcome, FetchStatus, ProviderStats};

pub struct JobCoordinator {
    sites: SiteRegistryHandle,
    transformers: Arc<TransformerRegistry>,
    fetcher: Arc<ProviderFetcher>,
    cache: Arc<CacheManager>,
    pool: Arc<Semaphore>,
    weights: ScoringWeights,
    cache_ttl: Duration,
}

impl JobCoordinator {
    pub fn new(
        sites: SiteRegistryHandle,
        transformers: Arc<TransformerRegistry>,
        fetcher: ProviderFetcher,
        cache: Arc<CacheManager>,
        pool_size: usize,
        weights: ScoringWeights,
        cache_ttl: Duration,
    ) -> Self {
        crate::metrics::describe_all();
        Self {
            sites,
            transformers,
            fetcher: Arc::new(fetcher),
            cache,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            weights,
            cache_ttl,
        }
    }

    /// Wire everything from configuration. The cache store follows `cache.backend`.
    pub fn from_config(
        cfg: &AppConfig,
        transport: Arc<dyn ProviderTransport>,
    ) -> Result<Self, ConfigError> {
        let store: Arc<dyn CacheStore> = match cfg.cache.backend {
            CacheBackend::Memory => Arc::new(MemoryStore::new()),
            CacheBackend::File => Arc::new(FileStore::new(cfg.cache.dir.clone())),
        };
        Self::from_config_with_store(cfg, transport, store)
    }

    pub fn from_config_with_store(
        cfg: &AppConfig,
        transport: Arc<dyn ProviderTransport>,
        store: Arc<dyn CacheStore>,
    ) -> Result<Self, ConfigError> {
        let transformers = cfg.transformers()?;
        let registry = cfg.site_registry(&transformers)?;
        let policy = RetryPolicy::from_config(&cfg.worker, &cfg.retry);
        info!(
            target: "coordinator",
            sites = registry.len(),
            pool_size = cfg.worker.pool_size,
            timeout_ms = policy.timeout.as_millis() as u64,
            max_retries = policy.max_retries,
            cache = store.name(),
            "coordinator configured"
        );
        Ok(Self::new(
            SiteRegistryHandle::new(registry),
            Arc::new(transformers),
            ProviderFetcher::new(transport, policy),
            Arc::new(CacheManager::new(store)),
            cfg.worker.pool_size,
            cfg.scoring.clone(),
            cfg.cache.ttl(),
        ))
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn sites(&self) -> &SiteRegistryHandle {
        &self.sites
    }

    pub fn transformers(&self) -> &TransformerRegistry {
        &self.transformers
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.fetcher.policy()
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Resolve `site_id` in the current snapshot, rejecting disabled sites.
    pub fn resolve_enabled(&self, site_id: &str) -> Result<Arc<SiteConfig>, CoordinatorError> {
        let site = self.sites.snapshot().resolve(site_id)?;
        if !site.enabled {
            return Err(CoordinatorError::Disabled(site_id.to_string()));
        }
        Ok(site)
    }

    /// Validate `sites` against this coordinator's transformer table and swap
    /// them in for subsequent runs. Runs in progress keep their snapshot.
    pub fn reload_sites(&self, sites: Vec<SiteConfig>) -> Result<usize, ConfigError> {
        let registry = SiteRegistry::new(sites, &self.transformers)?;
        let n = registry.len();
        self.sites.replace(registry);
        info!(target: "coordinator", sites = n, "site registry swapped");
        Ok(n)
    }

    /// Aggregate `site_id` for `date`, served from cache when fresh.
    pub async fn run(&self, site_id: &str, date: NaiveDate) -> Result<AggregateResult, CoordinatorError> {
        self.run_until(site_id, date, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops waiting once `shutdown` resolves.
    ///
    /// If this call is building the aggregate, unfinished providers are
    /// reported as `transient_error` and the partial aggregate is returned
    /// without being cached. If it is waiting on another caller's build, it
    /// returns `CoordinatorError::Cancelled` and that build carries on.
    pub async fn run_until<S>(
        &self,
        site_id: &str,
        date: NaiveDate,
        shutdown: S,
    ) -> Result<AggregateResult, CoordinatorError>
    where
        S: Future<Output = ()> + Send,
    {
        let site = match self.resolve_enabled(site_id) {
            Ok(s) => s,
            Err(e) => {
                counter!("coordinator_runs_total", "site" => site_id.to_string(), "outcome" => "rejected")
                    .increment(1);
                return Err(e);
            }
        };

        let started = Instant::now();
        // Fan the caller's single shutdown future out to both the build and the wait path.
        let (stop_tx, stop_rx) = watch::channel(false);
        let work = self.cache.get_or_build_until(
            site_id,
            date,
            self.cache_ttl,
            stopped(stop_rx.clone()),
            || self.build(site, date, stopped(stop_rx)),
        );
        tokio::pin!(work);
        tokio::pin!(shutdown);
        let mut stopping = false;
        let result = loop {
            tokio::select! {
                r = &mut work => break r,
                _ = &mut shutdown, if !stopping => {
                    stopping = true;
                    stop_tx.send_replace(true);
                }
            }
        };

        let outcome = match &result {
            Ok(r) if r.total_failure => "total_failure",
            Ok(r) if r.partial_success => "partial",
            Ok(_) => "success",
            Err(CoordinatorError::Cancelled(_)) => "cancelled",
            Err(_) => "error",
        };
        counter!("coordinator_runs_total", "site" => site_id.to_string(), "outcome" => outcome)
            .increment(1);
        gauge!("coordinator_last_run_ts").set(Utc::now().timestamp() as f64);
        info!(
            target: "coordinator",
            site = site_id,
            %date,
            outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run finished"
        );
        result
    }

    async fn build<S>(
        &self,
        site: Arc<SiteConfig>,
        date: NaiveDate,
        shutdown: S,
    ) -> Result<BuildOutcome, CoordinatorError>
    where
        S: Future<Output = ()> + Send,
    {
        let scorer = Arc::new(Scorer::for_date(self.weights.clone(), date));
        let budget = self.fetcher.policy().budget();

        let mut set = JoinSet::new();
        for decl in &site.providers {
            set.spawn(run_branch(
                decl.clone(),
                self.fetcher.clone(),
                self.transformers.clone(),
                scorer.clone(),
                self.pool.clone(),
                budget,
            ));
        }
        debug!(
            target: "coordinator",
            site = %site.site_id,
            %date,
            branches = site.providers.len(),
            budget_ms = budget.as_millis() as u64,
            "branches dispatched"
        );

        let mut branches = Vec::with_capacity(site.providers.len());
        let mut interrupted = false;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(branch)) => branches.push(branch),
                    Some(Err(e)) => {
                        set.abort_all();
                        return Err(CoordinatorError::Internal(format!("provider branch failed: {e}")));
                    }
                },
                _ = &mut shutdown, if !interrupted => {
                    interrupted = true;
                    set.abort_all();
                }
            }
            if interrupted {
                break;
            }
        }

        if interrupted {
            // Keep branches that finished before the abort landed.
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(branch) => branches.push(branch),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        return Err(CoordinatorError::Internal(format!("provider branch failed: {e}")));
                    }
                }
            }
            for decl in &site.providers {
                if !branches.iter().any(|b| b.provider_id() == decl.id) {
                    branches.push(ProviderBranch::failed(FetchOutcome::failure(
                        &decl.id,
                        FetchStatus::TransientError,
                        1,
                        0,
                        "cancelled: run interrupted",
                    )));
                }
            }
            warn!(target: "coordinator", site = %site.site_id, %date, "run interrupted, result will not be cached");
        }

        validate_branches(&site, &branches)?;
        let ttl = chrono::Duration::from_std(self.cache_ttl)
            .map_err(|e| CoordinatorError::Internal(format!("cache ttl out of range: {e}")))?;
        let result = merge(&site, date, branches, Utc::now(), ttl);
        result.check_invariants().map_err(CoordinatorError::Internal)?;

        Ok(if interrupted {
            BuildOutcome::Interrupted(result)
        } else {
            BuildOutcome::Fresh(result)
        })
    }
}

/// Resolves once the stop flag is raised. Never resolves if the flag's owner is gone.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let owner_gone = rx.wait_for(|stop| *stop).await.is_err();
    if owner_gone {
        std::future::pending::<()>().await;
    }
}

/// Fetch → transform → score for one provider. Always yields a branch.
async fn run_branch(
    provider: ProviderDecl,
    fetcher: Arc<ProviderFetcher>,
    transformers: Arc<TransformerRegistry>,
    scorer: Arc<Scorer>,
    pool: Arc<Semaphore>,
    budget: Duration,
) -> ProviderBranch {
    let _permit = match pool.acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
            return ProviderBranch::failed(FetchOutcome::failure(
                &provider.id,
                FetchStatus::TransientError,
                1,
                0,
                "worker pool closed",
            ))
        }
    };

    let started = Instant::now();
    let work = async {
        let outcome = fetcher.fetch(&provider.id, &provider.url).await;
        finish_branch(outcome, &transformers, &scorer)
    };
    let branch = match tokio::time::timeout(budget, work).await {
        Ok(branch) => branch,
        Err(_) => ProviderBranch::failed(FetchOutcome::failure(
            &provider.id,
            FetchStatus::Timeout,
            fetcher.policy().max_attempts(),
            started.elapsed().as_millis() as u64,
            format!("branch budget of {budget:?} exhausted"),
        )),
    };

    info!(
        target: "coordinator",
        provider = %provider.id,
        status = %branch.outcome.status,
        attempts = branch.outcome.attempts,
        latency_ms = branch.outcome.latency_ms,
        records = branch.records.len(),
        "provider branch done"
    );
    branch
}

fn finish_branch(outcome: FetchOutcome, transformers: &TransformerRegistry, scorer: &Scorer) -> ProviderBranch {
    if !outcome.status.is_success() {
        return ProviderBranch::failed(outcome);
    }
    let payload = outcome.raw_payload.as_deref().unwrap_or_default();
    match transformers.transform(&outcome.provider_id, payload, scorer) {
        Ok(batch) => ProviderBranch {
            stats: ProviderStats {
                fetched: batch.fetched,
                transformed: batch.records.len(),
                errors: 0,
            },
            records: batch.records,
            outcome,
        },
        Err(e) => {
            warn!(
                target: "coordinator",
                provider = %outcome.provider_id,
                error = %e,
                "payload rejected, provider marked fatal"
            );
            ProviderBranch::failed(outcome.downgrade_to_fatal(e.to_string()))
        }
    }
}
