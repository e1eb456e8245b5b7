// src/aggregate.rs
//! Merge of per-provider branches into one `AggregateResult`.
//!
//! The merge is a pure function of the branch *set*: arrival order never
//! changes the output.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::warn;

use crate::error::CoordinatorError;
use crate::sites::SiteConfig;
use crate::types::{AggregateResult, FetchOutcome, FetchStatus, ProviderStats, UnifiedRecord};

/// Everything one provider branch produced.
#[derive(Debug, Clone)]
pub struct ProviderBranch {
    pub outcome: FetchOutcome,
    /// Empty unless `outcome.status` is success.
    pub records: Vec<UnifiedRecord>,
    pub stats: ProviderStats,
}

impl ProviderBranch {
    pub fn failed(outcome: FetchOutcome) -> Self {
        Self {
            outcome,
            records: Vec::new(),
            stats: ProviderStats {
                errors: 1,
                ..ProviderStats::default()
            },
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.outcome.provider_id
    }
}

/// Rejects branch sets the coordinator should never produce: the same
/// provider twice, or a provider the site does not declare.
pub fn validate_branches(site: &SiteConfig, branches: &[ProviderBranch]) -> Result<(), CoordinatorError> {
    let mut seen = HashSet::with_capacity(branches.len());
    for b in branches {
        if site.declaration_index(b.provider_id()).is_none() {
            return Err(CoordinatorError::Internal(format!(
                "branch for undeclared provider '{}' on site '{}'",
                b.provider_id(),
                site.site_id
            )));
        }
        if !seen.insert(b.provider_id()) {
            return Err(CoordinatorError::Internal(format!(
                "provider '{}' produced more than one branch",
                b.provider_id()
            )));
        }
    }
    Ok(())
}

struct Candidate {
    record: UnifiedRecord,
    decl_idx: usize,
    position: usize,
}

impl Candidate {
    /// True if `self` should replace `other` for the same record_key.
    fn beats(&self, other: &Candidate) -> bool {
        match self.record.score.total_cmp(&other.record.score) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                (self.decl_idx, self.position) < (other.decl_idx, other.position)
            }
        }
    }
}

/// Merge branches for `site` on `date`. Never fails.
///
/// Declared providers without a branch are reported as `fatal_error`.
/// Branches for undeclared providers are dropped with a warning; a repeated
/// provider keeps its first branch.
pub fn merge(
    site: &SiteConfig,
    date: NaiveDate,
    branches: Vec<ProviderBranch>,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> AggregateResult {
    let mut by_provider: HashMap<String, ProviderBranch> = HashMap::with_capacity(branches.len());
    for b in branches {
        if site.declaration_index(b.provider_id()).is_none() {
            warn!(
                target: "coordinator",
                site = %site.site_id,
                provider = b.provider_id(),
                "ignoring branch for undeclared provider"
            );
            continue;
        }
        by_provider.entry(b.provider_id().to_string()).or_insert(b);
    }

    let mut provider_status = BTreeMap::new();
    let mut provider_stats = BTreeMap::new();
    let mut provider_errors = BTreeMap::new();
    let mut winners: HashMap<String, Candidate> = HashMap::new();
    let mut succeeded = 0usize;

    // Walk in declaration order so nothing below depends on arrival order.
    for (decl_idx, decl) in site.providers.iter().enumerate() {
        let branch = by_provider.remove(&decl.id).unwrap_or_else(|| {
            ProviderBranch::failed(FetchOutcome::failure(
                &decl.id,
                FetchStatus::FatalError,
                1,
                0,
                "no outcome recorded for provider",
            ))
        });

        provider_status.insert(decl.id.clone(), branch.outcome.status);
        provider_stats.insert(decl.id.clone(), branch.stats);
        if let Some(err) = &branch.outcome.error {
            provider_errors.insert(decl.id.clone(), err.clone());
        }
        if !branch.outcome.status.is_success() {
            continue;
        }
        succeeded += 1;

        for (position, record) in branch.records.into_iter().enumerate() {
            let cand = Candidate {
                record,
                decl_idx,
                position,
            };
            match winners.get(&cand.record.record_key) {
                Some(existing) if !cand.beats(existing) => {}
                _ => {
                    winners.insert(cand.record.record_key.clone(), cand);
                }
            }
        }
    }

    let mut records: Vec<UnifiedRecord> = winners.into_values().map(|c| c.record).collect();
    records.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.record_key.cmp(&b.record_key))
    });

    let declared = site.providers.len();
    AggregateResult {
        site_id: site.site_id.clone(),
        date,
        records,
        provider_status,
        provider_stats,
        provider_errors,
        partial_success: succeeded > 0 && succeeded < declared,
        total_failure: succeeded == 0,
        generated_at: now,
        ttl_expires_at: now + ttl,
    }
}
