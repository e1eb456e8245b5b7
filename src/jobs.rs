// src/jobs.rs
//! In-memory job tracking for runs triggered over HTTP.
//!
//! A job wraps one `JobCoordinator::run_until` call in a background task and
//! records its lifecycle: pending → processing → succeeded / failed / cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::JobCoordinator;
use crate::error::CoordinatorError;
use crate::types::AggregateResult;

/// Finished jobs kept before the oldest ones are dropped.
const DEFAULT_RETENTION: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    /// At least one provider delivered; `partial` if some did not.
    Succeeded { partial: bool },
    Failed { error: String },
    Cancelled,
}

impl JobState {
    /// Map a finished run onto a job state. A run where every provider failed
    /// is a failed job, even though the coordinator returned a result.
    pub fn from_run(result: &Result<AggregateResult, CoordinatorError>) -> Self {
        match result {
            Ok(r) if r.total_failure => JobState::Failed {
                error: "all providers failed".to_string(),
            },
            Ok(r) => JobState::Succeeded {
                partial: r.partial_success,
            },
            Err(CoordinatorError::Cancelled(_)) => JobState::Cancelled,
            Err(e) => JobState::Failed { error: e.to_string() },
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Processing)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: Uuid,
    pub site_id: String,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub result: Option<Arc<AggregateResult>>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, JobRecord>,
    cancels: HashMap<Uuid, oneshot::Sender<()>>,
}

#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<Mutex<Inner>>,
    retention: usize,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            retention: retention.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a background run for `site_id` on `date`. Unknown and disabled
    /// sites are rejected up front and no job is created.
    pub fn submit(
        &self,
        coordinator: Arc<JobCoordinator>,
        site_id: &str,
        date: NaiveDate,
    ) -> Result<Uuid, CoordinatorError> {
        coordinator.resolve_enabled(site_id)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        {
            let mut inner = self.lock();
            inner.jobs.insert(
                id,
                JobRecord {
                    id,
                    site_id: site_id.to_string(),
                    date,
                    state: JobState::Pending,
                    created_at: now,
                    updated_at: now,
                    result: None,
                },
            );
            inner.cancels.insert(id, cancel_tx);
            prune(&mut inner, self.retention);
        }
        info!(target: "coordinator", job = %id, site = site_id, %date, "job submitted");

        let tracker = self.clone();
        let site = site_id.to_string();
        tokio::spawn(async move {
            tracker.set_state(id, JobState::Processing);
            let shutdown = async move {
                // A dropped sender means the job can no longer be cancelled.
                if cancel_rx.await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            let result = coordinator.run_until(&site, date, shutdown).await;
            tracker.finish(id, result);
        });
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<JobRecord> {
        self.lock().jobs.get(id).cloned()
    }

    /// Signal a running job to stop. Returns false if the job is unknown or
    /// already finished.
    pub fn cancel(&self, id: &Uuid) -> bool {
        let sender = {
            let mut inner = self.lock();
            let live = inner.jobs.get(id).is_some_and(|j| !j.state.is_finished());
            if live {
                inner.cancels.remove(id)
            } else {
                None
            }
        };
        match sender {
            Some(tx) => {
                let sent = tx.send(()).is_ok();
                if sent {
                    info!(target: "coordinator", job = %id, "job cancellation requested");
                }
                sent
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_state(&self, id: Uuid, state: JobState) {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.state = state;
            job.updated_at = Utc::now();
        }
    }

    fn finish(&self, id: Uuid, result: Result<AggregateResult, CoordinatorError>) {
        let mut inner = self.lock();
        // Sender gone while the job was live means cancel() took it.
        let cancelled = inner.cancels.remove(&id).is_none();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return;
        };
        job.state = if cancelled {
            JobState::Cancelled
        } else {
            JobState::from_run(&result)
        };
        job.updated_at = Utc::now();
        match result {
            Ok(r) => job.result = Some(Arc::new(r)),
            Err(e) => warn!(target: "coordinator", job = %id, error = %e, "job failed"),
        }
    }
}

/// Drop the oldest finished jobs once more than `retention` are finished.
fn prune(inner: &mut Inner, retention: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = inner
        .jobs
        .values()
        .filter(|j| j.state.is_finished())
        .map(|j| (j.updated_at, j.id))
        .collect();
    if finished.len() <= retention {
        return;
    }
    finished.sort();
    let excess = finished.len() - retention;
    for (_, id) in finished.into_iter().take(excess) {
        inner.jobs.remove(&id);
    }
}
