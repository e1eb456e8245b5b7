// src/scheduler.rs
//! Periodic trigger: every tick runs each enabled site for its effective date.
//! [`SchedulerControl`] owns the running trigger so it can be started, stopped
//! and inspected at runtime; aggregation state stays in the coordinator.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::coordinator::JobCoordinator;

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerCfg {
    pub interval_secs: u64,
    /// Start ticks on the next multiple of `interval_secs` past the hour.
    pub align_to_hour: bool,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            align_to_hour: true,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub succeeded: Vec<String>,
    pub partial: Vec<String>,
    pub total_failure: Vec<String>,
    pub errored: Vec<String>,
}

impl TickReport {
    pub fn runs(&self) -> usize {
        self.succeeded.len() + self.partial.len() + self.total_failure.len() + self.errored.len()
    }
}

/// Run every enabled site once, concurrently, for the date its strategy picks at `now`.
pub async fn tick_once(coordinator: &Arc<JobCoordinator>, now: DateTime<Utc>) -> TickReport {
    let sites = coordinator.sites().snapshot().list_enabled();
    let mut set = JoinSet::new();
    for site in sites {
        let coord = coordinator.clone();
        let date = site.effective_date(now);
        set.spawn(async move {
            let r = coord.run(&site.site_id, date).await;
            (site.site_id.clone(), r)
        });
    }

    let mut report = TickReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((site, Ok(r))) if r.total_failure => report.total_failure.push(site),
            Ok((site, Ok(r))) if r.partial_success => report.partial.push(site),
            Ok((site, Ok(_))) => report.succeeded.push(site),
            Ok((site, Err(e))) => {
                warn!(target: "scheduler", site = %site, error = %e, "scheduled run failed");
                report.errored.push(site);
            }
            Err(e) => warn!(target: "scheduler", error = %e, "scheduled run task failed"),
        }
    }
    for list in [
        &mut report.succeeded,
        &mut report.partial,
        &mut report.total_failure,
        &mut report.errored,
    ] {
        list.sort();
    }

    info!(
        target: "scheduler",
        runs = report.runs(),
        partial = report.partial.len(),
        total_failure = report.total_failure.len(),
        errored = report.errored.len(),
        "scheduler tick"
    );
    report
}

/// Delay from `now` until the next multiple of `interval_secs` counted from the top of the hour.
pub fn delay_to_next_slot(now: DateTime<Utc>, interval_secs: u64) -> Duration {
    let interval = interval_secs.max(1);
    let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    let rem = into_hour % interval;
    let secs = if rem == 0 && now.nanosecond() == 0 {
        0
    } else {
        interval - rem
    };
    Duration::from_secs(secs).saturating_sub(Duration::from_nanos(u64::from(now.nanosecond() % 1_000_000_000)))
}

/// Report of the most recent completed tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastTick {
    pub at: DateTime<Utc>,
    pub report: TickReport,
}

type LastTickSlot = Arc<Mutex<Option<LastTick>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Spawn the periodic trigger; each finished tick lands in `last`. Abort the handle to stop it.
fn spawn_periodic(
    coordinator: Arc<JobCoordinator>,
    cfg: SchedulerCfg,
    last: LastTickSlot,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(cfg.interval_secs.max(1));
        let first = if cfg.align_to_hour {
            delay_to_next_slot(Utc::now(), cfg.interval_secs)
        } else {
            Duration::ZERO
        };
        info!(
            target: "scheduler",
            interval_secs = period.as_secs(),
            first_tick_in_secs = first.as_secs(),
            "scheduler started"
        );
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + first, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let at = Utc::now();
            let report = tick_once(&coordinator, at).await;
            *lock(&last) = Some(LastTick { at, report });
        }
    })
}

/// Snapshot returned by [`SchedulerControl::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub config: SchedulerCfg,
    /// `None` while stopped.
    pub next_run: Option<DateTime<Utc>>,
    pub last_tick: Option<LastTick>,
}

/// Start/stop switch around the periodic trigger, shared by the binary and the admin API.
pub struct SchedulerControl {
    coordinator: Arc<JobCoordinator>,
    cfg: SchedulerCfg,
    handle: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    last: LastTickSlot,
}

impl SchedulerControl {
    /// Created stopped.
    pub fn new(coordinator: Arc<JobCoordinator>, cfg: SchedulerCfg) -> Self {
        Self {
            coordinator,
            cfg,
            handle: Mutex::new(None),
            started_at: Mutex::new(None),
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> SchedulerCfg {
        self.cfg
    }

    pub fn is_running(&self) -> bool {
        lock(&self.handle).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Returns `false` if the trigger was already running.
    pub fn start(&self) -> bool {
        let mut handle = lock(&self.handle);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        *handle = Some(spawn_periodic(
            self.coordinator.clone(),
            self.cfg,
            self.last.clone(),
        ));
        *lock(&self.started_at) = Some(Utc::now());
        true
    }

    /// Returns `false` if the trigger was not running. A tick in progress is aborted.
    pub fn stop(&self) -> bool {
        let Some(h) = lock(&self.handle).take() else {
            return false;
        };
        let was_running = !h.is_finished();
        h.abort();
        *lock(&self.started_at) = None;
        if was_running {
            info!(target: "scheduler", "scheduler stopped");
        }
        was_running
    }

    pub fn last_tick(&self) -> Option<LastTick> {
        lock(&self.last).clone()
    }

    /// When the running trigger fires next, as seen from `now`.
    pub fn next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_running() {
            return None;
        }
        if self.cfg.align_to_hour {
            let wait = delay_to_next_slot(now, self.cfg.interval_secs);
            return chrono::Duration::from_std(wait).ok().map(|d| now + d);
        }
        // Unaligned triggers tick on start, then every interval after the last tick.
        let started = *lock(&self.started_at);
        let anchor = self.last_tick().map(|t| t.at).or(started).unwrap_or(now);
        let period = self.cfg.interval_secs.max(1) as i64;
        let elapsed = (now - anchor).num_seconds().max(0);
        let steps = (elapsed + period - 1) / period;
        Some(anchor + chrono::Duration::seconds(steps * period))
    }

    pub fn status(&self, now: DateTime<Utc>) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            config: self.cfg,
            next_run: self.next_run(now),
            last_tick: self.last_tick(),
        }
    }
}

impl Drop for SchedulerControl {
    fn drop(&mut self) {
        if let Some(h) = lock(&self.handle).take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_slot_is_top_of_hour() {
        let now = Utc.with_ymd_and_hms(2025, 5, 10, 10, 45, 30).unwrap();
        assert_eq!(delay_to_next_slot(now, 3_600), Duration::from_secs(14 * 60 + 30));

        let on_the_hour = Utc.with_ymd_and_hms(2025, 5, 10, 11, 0, 0).unwrap();
        assert_eq!(delay_to_next_slot(on_the_hour, 3_600), Duration::ZERO);
    }

    #[test]
    fn shorter_intervals_align_within_hour() {
        let now = Utc.with_ymd_and_hms(2025, 5, 10, 10, 7, 0).unwrap();
        assert_eq!(delay_to_next_slot(now, 900), Duration::from_secs(8 * 60));
    }
}
