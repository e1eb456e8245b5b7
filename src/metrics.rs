use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// Register help text for every metric the engine emits. Safe to call repeatedly.
pub fn describe_all() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "provider_fetch_attempts_total",
            "HTTP attempts made against providers (retries included)."
        );
        describe_counter!(
            "provider_fetch_failures_total",
            "Provider fetches that ended without a payload, by final status."
        );
        describe_histogram!(
            "provider_fetch_latency_ms",
            "Wall time of successful provider fetches in milliseconds."
        );
        describe_counter!(
            "transform_errors_total",
            "Provider payloads rejected as malformed."
        );
        describe_counter!("cache_hits_total", "Aggregate cache hits.");
        describe_counter!("cache_misses_total", "Aggregate cache misses.");
        describe_counter!(
            "cache_builds_total",
            "Aggregate builds started by the cache (one per key in flight)."
        );
        describe_counter!(
            "cache_degraded_total",
            "Cache store operations that failed and were ignored."
        );
        describe_counter!("coordinator_runs_total", "Coordinator runs by site and outcome.");
        describe_gauge!(
            "coordinator_last_run_ts",
            "Unix ts when the coordinator last finished a run."
        );
        describe_gauge!("cache_ttl_secs", "Configured aggregate cache TTL in seconds.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and publish the cache TTL as a static gauge.
    pub fn init(cache_ttl_secs: u64) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        describe_all();
        gauge!("cache_ttl_secs").set(cache_ttl_secs as f64);
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
