// src/fetch/mod.rs
//! Provider fetch worker: one logical fetch with per-attempt timeout, failure
//! classification and a bounded retry loop. Every call ends in a
//! [`FetchOutcome`]; nothing here returns an error.

pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::{RetryConfig, WorkerConfig};
use crate::types::{FetchOutcome, FetchStatus};
pub use transport::{ProviderTransport, ReqwestTransport, TransportError, TransportResponse};

/// Slack on top of the worst-case retry schedule before a branch is abandoned.
const BUDGET_GRACE: Duration = Duration::from_millis(100);

/// Timeout/retry/backoff knobs for one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub retry_on_server_errors: bool,
    pub retry_on_429: bool,
    pub extra_retry_status: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default(), &RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(worker: &WorkerConfig, retry: &RetryConfig) -> Self {
        Self {
            timeout: worker.timeout(),
            max_retries: worker.retries(),
            backoff_base: Duration::from_millis(worker.backoff_base_ms),
            backoff_max: Duration::from_millis(worker.backoff_max_ms),
            retry_on_server_errors: retry.retry_on_server_errors,
            retry_on_429: retry.retry_on_429,
            extra_retry_status: retry.extra_retry_status.clone(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_retryable_status(&self, code: u16) -> bool {
        if self.extra_retry_status.contains(&code) {
            return true;
        }
        match code {
            429 => self.retry_on_429,
            500..=599 => self.retry_on_server_errors,
            _ => false,
        }
    }

    /// Sleep after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(exp).min(self.backoff_max)
    }

    /// Worst-case wall time of one fetch: every attempt timing out plus every backoff.
    pub fn budget(&self) -> Duration {
        let attempts = self.timeout.saturating_mul(self.max_attempts());
        let backoff = (1..=self.max_retries)
            .map(|a| self.backoff_for(a))
            .fold(Duration::ZERO, Duration::saturating_add);
        attempts.saturating_add(backoff).saturating_add(BUDGET_GRACE)
    }
}

#[derive(Debug)]
enum Failure {
    /// Connection reset, DNS, timeout. Retryable.
    Transient { timed_out: bool, message: String },
    /// Retryable HTTP status (5xx, optionally 429).
    Server { code: u16, message: String },
    /// Not retried: 4xx, malformed response.
    Fatal { status: FetchStatus, message: String },
}

impl Failure {
    fn exhausted_status(&self) -> FetchStatus {
        match self {
            Failure::Transient { timed_out: true, .. } => FetchStatus::Timeout,
            Failure::Transient { .. } => FetchStatus::TransientError,
            Failure::Server { code, .. } => FetchStatus::HttpError(*code),
            Failure::Fatal { status, .. } => *status,
        }
    }

    fn message(&self) -> &str {
        match self {
            Failure::Transient { message, .. }
            | Failure::Server { message, .. }
            | Failure::Fatal { message, .. } => message,
        }
    }
}

fn classify_response(resp: TransportResponse, policy: &RetryPolicy) -> Result<String, Failure> {
    let code = resp.status;
    if (200..300).contains(&code) {
        if resp.body.trim().is_empty() {
            return Err(Failure::Fatal {
                status: FetchStatus::FatalError,
                message: format!("HTTP {code} with empty body"),
            });
        }
        return Ok(resp.body);
    }
    let message = format!("HTTP {code}");
    if policy.is_retryable_status(code) {
        Err(Failure::Server { code, message })
    } else {
        Err(Failure::Fatal {
            status: FetchStatus::HttpError(code),
            message,
        })
    }
}

fn classify_transport_error(e: TransportError) -> Failure {
    if let TransportError::Decode(_) = e {
        return Failure::Fatal {
            status: FetchStatus::FatalError,
            message: e.to_string(),
        };
    }
    let timed_out = matches!(e, TransportError::Timeout);
    Failure::Transient {
        timed_out,
        message: e.to_string(),
    }
}

/// Fetch `url` for `provider_id` following `policy`.
pub async fn fetch(
    transport: &dyn ProviderTransport,
    provider_id: &str,
    url: &str,
    policy: &RetryPolicy,
) -> FetchOutcome {
    let started = Instant::now();
    let max_attempts = policy.max_attempts();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        counter!("provider_fetch_attempts_total", "provider" => provider_id.to_string())
            .increment(1);
        debug!(target: "fetch", provider = provider_id, attempt, max_attempts, %url, "fetching");

        let result = match tokio::time::timeout(policy.timeout, transport.get(url, policy.timeout)).await {
            Ok(Ok(resp)) => classify_response(resp, policy),
            Ok(Err(e)) => Err(classify_transport_error(e)),
            Err(_) => Err(Failure::Transient {
                timed_out: true,
                message: format!("no response within {:?}", policy.timeout),
            }),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(body) => {
                histogram!("provider_fetch_latency_ms", "provider" => provider_id.to_string())
                    .record(latency_ms as f64);
                return FetchOutcome::success(provider_id, body, attempt, latency_ms);
            }
            Err(failure @ Failure::Fatal { .. }) => {
                warn!(
                    target: "fetch",
                    provider = provider_id,
                    attempt,
                    error = failure.message(),
                    "fatal provider response, not retrying"
                );
                return fail(provider_id, &failure, attempt, latency_ms);
            }
            Err(failure) if attempt < max_attempts => {
                let wait = policy.backoff_for(attempt);
                warn!(
                    target: "fetch",
                    provider = provider_id,
                    attempt,
                    error = failure.message(),
                    backoff_ms = wait.as_millis() as u64,
                    "provider fetch failed, retrying"
                );
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
            Err(failure) => {
                error!(
                    target: "fetch",
                    provider = provider_id,
                    attempts = attempt,
                    error = failure.message(),
                    "provider fetch failed after max retries"
                );
                return fail(provider_id, &failure, attempt, latency_ms);
            }
        }
    }
}

fn fail(provider_id: &str, failure: &Failure, attempts: u32, latency_ms: u64) -> FetchOutcome {
    let status = failure.exhausted_status();
    counter!(
        "provider_fetch_failures_total",
        "provider" => provider_id.to_string(),
        "status" => status.label()
    )
    .increment(1);
    FetchOutcome::failure(provider_id, status, attempts, latency_ms, failure.message())
}

/// A transport bundled with the policy every branch of a run uses.
#[derive(Clone)]
pub struct ProviderFetcher {
    transport: Arc<dyn ProviderTransport>,
    policy: RetryPolicy,
}

impl ProviderFetcher {
    pub fn new(transport: Arc<dyn ProviderTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch(&self, provider_id: &str, url: &str) -> FetchOutcome {
        fetch(self.transport.as_ref(), provider_id, url, &self.policy).await
    }
}
