use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::coordinator::JobCoordinator;
use crate::error::CoordinatorError;
use crate::jobs::{JobRecord, JobTracker};
use crate::scheduler::{SchedulerCfg, SchedulerControl};
use crate::sites::SiteConfig;
use crate::types::UnifiedRecord;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1_000;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<JobCoordinator>,
    pub jobs: JobTracker,
    pub scheduler: Arc<SchedulerControl>,
}

impl AppState {
    /// Hourly scheduler, not yet started.
    pub fn new(coordinator: Arc<JobCoordinator>) -> Self {
        Self::with_scheduler(coordinator, SchedulerCfg::default())
    }

    pub fn with_scheduler(coordinator: Arc<JobCoordinator>, cfg: SchedulerCfg) -> Self {
        Self {
            scheduler: Arc::new(SchedulerControl::new(coordinator.clone(), cfg)),
            coordinator,
            jobs: JobTracker::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/sitedata/fetch", post(submit_fetch))
        .route("/sitedata/jobs/{job_id}", get(job_status).delete(cancel_job))
        .route("/sitedata/jobs/{job_id}/results", get(job_results))
        .route(
            "/sitedata/cache/{site_id}/{date}",
            get(cached_aggregate).delete(invalidate_cached),
        )
        .route("/admin/cache", delete(clear_cache))
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/reload-sites", post(reload_sites))
        .route("/admin/scheduler/status", get(scheduler_status))
        .route("/admin/scheduler/start", post(scheduler_start))
        .route("/admin/scheduler/stop", post(scheduler_stop))
        .route("/admin/scheduler/sites-configs", get(scheduler_sites))
        .route("/admin/scheduler/next-runs", get(scheduler_next_runs))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::NotFound(_) => ApiError::NotFound(e.to_string()),
            CoordinatorError::Disabled(_) | CoordinatorError::Cancelled(_) => {
                ApiError::Conflict(e.to_string())
            }
            CoordinatorError::Internal(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("invalid date '{raw}', expected YYYY-MM-DD")))
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid job id '{raw}'")))
}

fn find_job(state: &AppState, raw: &str) -> Result<JobRecord, ApiError> {
    let id = parse_job_id(raw)?;
    state
        .jobs
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("job '{id}' not found")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchReq {
    site_id: String,
    /// YYYY-MM-DD; the site's date strategy decides when absent.
    #[serde(default)]
    date: Option<String>,
}

async fn submit_fetch(
    State(state): State<AppState>,
    Json(body): Json<FetchReq>,
) -> Result<impl IntoResponse, ApiError> {
    let date = match body.date.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => state
            .coordinator
            .resolve_enabled(&body.site_id)?
            .effective_date(Utc::now()),
    };
    let id = state
        .jobs
        .submit(state.coordinator.clone(), &body.site_id, date)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "jobId": id,
            "siteId": body.site_id,
            "date": date,
            "status": "pending",
        })),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = find_job(&state, &job_id)?;
    let mut body = serde_json::to_value(&job).map_err(|e| ApiError::Internal(e.to_string()))?;
    if let (Some(result), Some(obj)) = (job.result.as_ref(), body.as_object_mut()) {
        obj.insert("providerStatus".into(), json!(result.provider_status));
        obj.insert("stats".into(), json!(result.provider_stats));
        obj.insert("providerErrors".into(), json!(result.provider_errors));
        obj.insert("recordCount".into(), json!(result.records.len()));
        obj.insert("partialSuccess".into(), json!(result.partial_success));
        obj.insert("totalFailure".into(), json!(result.total_failure));
    }
    Ok(Json(body))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = find_job(&state, &job_id)?;
    if job.state.is_finished() {
        return Err(ApiError::Conflict(format!("job '{}' already finished", job.id)));
    }
    let cancelled = state.jobs.cancel(&job.id);
    Ok(Json(json!({ "jobId": job.id, "cancelled": cancelled })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultsQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
    /// Case-insensitive substring of the supplier.
    #[serde(default)]
    supplier: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    confirmed: Option<bool>,
    /// Inclusive bounds on `published_at`: RFC 3339 or YYYY-MM-DD.
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    site_id: Option<String>,
    #[serde(default)]
    sort_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortBy {
    Score { desc: bool },
    PublishedAt { desc: bool },
}

impl FromStr for SortBy {
    type Err = ApiError;

    /// `score desc`, `publishedAt:asc`, `score` (descending by default).
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let norm = raw.replace(':', " ").to_ascii_lowercase();
        let mut parts = norm.split_whitespace();
        let field = parts.next().unwrap_or("score");
        let desc = match parts.next() {
            None | Some("desc") => true,
            Some("asc") => false,
            Some(_) => return Err(ApiError::BadRequest(format!("invalid sortBy '{raw}'"))),
        };
        if parts.next().is_some() {
            return Err(ApiError::BadRequest(format!("invalid sortBy '{raw}'")));
        }
        match field {
            "score" => Ok(SortBy::Score { desc }),
            "publishedat" | "published_at" => Ok(SortBy::PublishedAt { desc }),
            _ => Err(ApiError::BadRequest(format!("invalid sortBy '{raw}'"))),
        }
    }
}

impl SortBy {
    fn label(self) -> &'static str {
        match self {
            SortBy::Score { desc: true } => "score desc",
            SortBy::Score { desc: false } => "score asc",
            SortBy::PublishedAt { desc: true } => "publishedAt desc",
            SortBy::PublishedAt { desc: false } => "publishedAt asc",
        }
    }

    fn compare(self, a: &UnifiedRecord, b: &UnifiedRecord) -> Ordering {
        match self {
            SortBy::Score { desc: true } => b.score.total_cmp(&a.score),
            SortBy::Score { desc: false } => a.score.total_cmp(&b.score),
            // undated records sort last either way
            SortBy::PublishedAt { desc } => match (a.fields.published_at, b.fields.published_at) {
                (Some(x), Some(y)) if desc => y.cmp(&x),
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
        }
    }
}

/// `end` widens a bare date to the last instant of that day.
fn parse_bound(name: &str, raw: &str, end: bool) -> Result<DateTime<Utc>, ApiError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        ApiError::BadRequest(format!("invalid {name} '{raw}', expected RFC 3339 or YYYY-MM-DD"))
    })?;
    let at = if end {
        day.and_hms_nano_opt(23, 59, 59, 999_999_999)
    } else {
        day.and_hms_opt(0, 0, 0)
    };
    at.map(|t| Utc.from_utc_datetime(&t))
        .ok_or_else(|| ApiError::BadRequest(format!("invalid {name} '{raw}'")))
}

struct RecordFilter {
    supplier: Option<String>,
    status: Option<String>,
    confirmed: Option<bool>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

impl RecordFilter {
    fn from_query(q: &ResultsQuery) -> Result<Self, ApiError> {
        let from = q.from.as_deref().map(|r| parse_bound("from", r, false)).transpose()?;
        let to = q.to.as_deref().map(|r| parse_bound("to", r, true)).transpose()?;
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(ApiError::BadRequest("'from' is after 'to'".into()));
            }
        }
        Ok(Self {
            supplier: q.supplier.as_deref().map(str::to_lowercase),
            status: q.status.clone(),
            confirmed: q.confirmed,
            from,
            to,
        })
    }

    fn matches(&self, r: &UnifiedRecord) -> bool {
        let f = &r.fields;
        if let Some(needle) = &self.supplier {
            if !f.supplier.to_lowercase().contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if !f.status.eq_ignore_ascii_case(status) {
                return false;
            }
        }
        if self.confirmed.is_some_and(|c| c != f.confirmed) {
            return false;
        }
        if self.from.is_some() || self.to.is_some() {
            let Some(at) = f.published_at else {
                return false;
            };
            if self.from.is_some_and(|from| at < from) || self.to.is_some_and(|to| at > to) {
                return false;
            }
        }
        true
    }
}

async fn job_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = find_job(&state, &job_id)?;
    let Some(result) = job.result.as_ref() else {
        return Err(ApiError::Conflict(format!("job '{}' has no results yet", job.id)));
    };
    let filter = RecordFilter::from_query(&query)?;
    let sort = match query.sort_by.as_deref() {
        Some(raw) => raw.parse()?,
        None => SortBy::Score { desc: true },
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = query.offset.unwrap_or(0);

    let site_matches = query.site_id.as_deref().map_or(true, |s| s == result.site_id);
    let mut matched: Vec<&UnifiedRecord> = if site_matches {
        result.records.iter().filter(|r| filter.matches(r)).collect()
    } else {
        Vec::new()
    };
    matched.sort_by(|a, b| sort.compare(a, b));
    let total = matched.len();
    let items: Vec<_> = matched.into_iter().skip(offset).take(limit).collect();
    Ok(Json(json!({
        "jobId": job.id,
        "siteId": result.site_id,
        "total": total,
        "limit": limit,
        "offset": offset,
        "sortBy": sort.label(),
        "items": items,
    })))
}

async fn cached_aggregate(
    State(state): State<AppState>,
    Path((site_id, date)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let date = parse_date(&date)?;
    let hit = state.coordinator.cache().get(&site_id, date).await;
    match hit {
        Some(r) => Ok(Json(json!(r))),
        None => Err(ApiError::NotFound(format!("no cached aggregate for {site_id} on {date}"))),
    }
}

async fn invalidate_cached(
    State(state): State<AppState>,
    Path((site_id, date)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let date = parse_date(&date)?;
    state.coordinator.cache().invalidate(&site_id, date).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_cache(State(state): State<AppState>) -> StatusCode {
    state.coordinator.cache().clear().await;
    info!("cache cleared by admin request");
    StatusCode::NO_CONTENT
}

async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = state.coordinator.cache();
    Json(json!({
        "store": cache.store_name(),
        "ttlSecs": state.coordinator.cache_ttl().as_secs(),
        "stats": cache.stats(),
    }))
}

async fn reload_sites(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let cfg = AppConfig::load_default().map_err(|e| {
        warn!(error = %e, "site reload failed");
        ApiError::BadRequest(e.to_string())
    })?;
    let n = state.coordinator.reload_sites(cfg.sites).map_err(|e| {
        warn!(error = %e, "site reload rejected");
        ApiError::BadRequest(e.to_string())
    })?;
    Ok(Json(json!({ "reloaded": true, "sites": n })))
}

async fn scheduler_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.scheduler.status(Utc::now())))
}

async fn scheduler_start(State(state): State<AppState>) -> Json<serde_json::Value> {
    let started = state.scheduler.start();
    let message = if started {
        "scheduler started"
    } else {
        "scheduler already running"
    };
    Json(json!({ "started": started, "running": true, "message": message }))
}

async fn scheduler_stop(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stopped = state.scheduler.stop();
    let message = if stopped {
        "scheduler stopped"
    } else {
        "scheduler not running"
    };
    Json(json!({ "stopped": stopped, "running": false, "message": message }))
}

async fn scheduler_sites(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.coordinator.sites().snapshot().list_all();
    let sites: Vec<&SiteConfig> = snapshot.iter().map(|s| s.as_ref()).collect();
    let enabled = sites.iter().filter(|s| s.enabled).count();
    Json(json!({
        "configs": sites,
        "total": sites.len(),
        "enabled": enabled,
        "disabled": sites.len() - enabled,
    }))
}

async fn scheduler_next_runs(State(state): State<AppState>) -> Json<serde_json::Value> {
    let next = state.scheduler.next_run(Utc::now());
    let runs: Vec<_> = state
        .coordinator
        .sites()
        .snapshot()
        .list_enabled()
        .iter()
        .map(|site| {
            json!({
                "siteId": site.site_id,
                "nextRun": next,
                "date": next.map(|at| site.effective_date(at)),
            })
        })
        .collect();
    Json(json!({
        "running": next.is_some(),
        "total": runs.len(),
        "nextRuns": runs,
    }))
}
