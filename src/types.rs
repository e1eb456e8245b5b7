// src/types.rs
//! Data carried through one coordinator run: fetch outcomes, unified records
//! and the merged aggregate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Final status of one provider branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum FetchStatus {
    Success,
    Timeout,
    HttpError(u16),
    TransientError,
    FatalError,
}

impl FetchStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchStatus::Success)
    }

    /// Short label used for metric labels and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            FetchStatus::Success => "success",
            FetchStatus::Timeout => "timeout",
            FetchStatus::HttpError(_) => "http_error",
            FetchStatus::TransientError => "transient_error",
            FetchStatus::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStatus::HttpError(code) => write!(f, "http_error({code})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Result of one logical fetch (all attempts) against one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub provider_id: String,
    pub status: FetchStatus,
    /// Present iff `status` is `Success`.
    #[serde(skip)]
    pub raw_payload: Option<String>,
    pub attempts: u32,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn success(provider_id: &str, payload: String, attempts: u32, latency_ms: u64) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            status: FetchStatus::Success,
            raw_payload: Some(payload),
            attempts: attempts.max(1),
            latency_ms,
            error: None,
        }
    }

    pub fn failure(
        provider_id: &str,
        status: FetchStatus,
        attempts: u32,
        latency_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            status,
            raw_payload: None,
            attempts: attempts.max(1),
            latency_ms,
            error: Some(error.into()),
        }
    }

    /// A payload that could not be transformed turns the whole provider into a fatal outcome.
    pub fn downgrade_to_fatal(mut self, error: impl Into<String>) -> Self {
        self.status = FetchStatus::FatalError;
        self.raw_payload = None;
        self.error = Some(error.into());
        self
    }
}

/// Normalized, provider-agnostic attributes of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFields {
    pub external_id: String,
    pub title: String,
    pub supplier: String,
    pub status: String,
    pub confirmed: bool,
    pub published_at: Option<DateTime<Utc>>,
    /// Provider-declared position, 1 = top.
    pub rank: Option<u32>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub record_key: String,
    pub fields: RecordFields,
    pub score: f64,
    pub source_provider_id: String,
}

/// Per-provider counters, same shape as the job statistics the status layer reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub fetched: usize,
    pub transformed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub site_id: String,
    pub date: NaiveDate,
    pub records: Vec<UnifiedRecord>,
    pub provider_status: BTreeMap<String, FetchStatus>,
    #[serde(default)]
    pub provider_stats: BTreeMap<String, ProviderStats>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_errors: BTreeMap<String, String>,
    pub partial_success: bool,
    pub total_failure: bool,
    pub generated_at: DateTime<Utc>,
    pub ttl_expires_at: DateTime<Utc>,
}

impl AggregateResult {
    pub fn succeeded_providers(&self) -> usize {
        self.provider_status
            .values()
            .filter(|s| s.is_success())
            .count()
    }

    /// Checks the structural guarantees every merge must uphold.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.partial_success && self.total_failure {
            return Err("partial_success and total_failure are both set".into());
        }
        if self.total_failure && !self.records.is_empty() {
            return Err(format!(
                "total_failure with {} records",
                self.records.len()
            ));
        }
        let mut seen = std::collections::HashSet::with_capacity(self.records.len());
        for r in &self.records {
            if !seen.insert(r.record_key.as_str()) {
                return Err(format!("duplicate record_key {}", r.record_key));
            }
        }
        Ok(())
    }
}
