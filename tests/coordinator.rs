// tests/coordinator.rs
//
// End-to-end coordinator runs against a scripted transport: fetch, retry,
// transform, score, merge and cache, without sockets.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use site_aggregator::fetch::{TransportError, TransportResponse};
use site_aggregator::{CoordinatorError, FetchStatus, ProviderTransport};

/// Answers every GET with the `site_a` payload after a short delay and
/// remembers the highest number of GETs it saw at once.
#[derive(Default)]
struct Gauged {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

#[async_trait]
impl ProviderTransport for Gauged {
    async fn get(&self, _url: &str, _timeout: Duration) -> Result<TransportResponse, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(TransportResponse {
            status: 200,
            body: SITE_A_JSON.to_string(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn news_is_partial_when_one_provider_times_out() {
    let transport = Arc::new(
        MockTransport::new()
            .route(URL_A, vec![Reply::Hang])
            .route(URL_B, vec![Reply::Ok(SITE_B_JSON.into())]),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport.clone());

    let r = coord.run("news", date()).await.expect("provider failures never raise");

    assert_eq!(r.provider_status["site_a"], FetchStatus::Timeout);
    assert_eq!(r.provider_status["site_b"], FetchStatus::Success);
    assert!(r.partial_success);
    assert!(!r.total_failure);
    assert_eq!(r.records.len(), 2);
    assert!(r.records.iter().all(|x| x.source_provider_id == "site_b"));
    // timeout 1s, one retry
    assert_eq!(transport.calls(URL_A), 2);
    r.check_invariants().unwrap();
}

#[tokio::test]
async fn news_is_total_failure_when_both_return_500() {
    let transport = Arc::new(
        MockTransport::new()
            .route(URL_A, vec![Reply::Status(500)])
            .route(URL_B, vec![Reply::Status(500)]),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport.clone());

    let r = coord.run("news", date()).await.unwrap();

    assert!(r.total_failure);
    assert!(!r.partial_success);
    assert!(r.records.is_empty());
    assert_eq!(r.provider_status["site_a"], FetchStatus::HttpError(500));
    assert_eq!(r.provider_status["site_b"], FetchStatus::HttpError(500));
    assert_eq!(transport.calls(URL_A), 2);
    assert_eq!(r.provider_stats["site_a"].errors, 1);
}

#[tokio::test]
async fn full_success_merges_and_deduplicates() {
    let transport = Arc::new(
        MockTransport::new()
            .route(URL_A, vec![Reply::Ok(SITE_A_JSON.into())])
            .route(URL_B, vec![Reply::Ok(SITE_B_JSON.into())]),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport);

    let r = coord.run("news", date()).await.unwrap();

    assert!(!r.partial_success && !r.total_failure);
    // 3 + 2 items, one shared between providers
    assert_eq!(r.records.len(), 4);
    let shipment: Vec<_> = r
        .records
        .iter()
        .filter(|x| x.fields.title == "Shipment delayed at port")
        .collect();
    assert_eq!(shipment.len(), 1);
    // site_b's copy is confirmed and newer, so it outscores site_a's
    assert_eq!(shipment[0].source_provider_id, "site_b");

    for w in r.records.windows(2) {
        assert!(
            w[0].score > w[1].score || (w[0].score == w[1].score && w[0].record_key < w[1].record_key)
        );
    }
    assert_eq!(r.provider_stats["site_a"].fetched, 3);
    assert_eq!(r.provider_stats["site_a"].transformed, 3);
    r.check_invariants().unwrap();
}

#[tokio::test]
async fn malformed_payload_marks_provider_fatal() {
    let transport = Arc::new(
        MockTransport::new()
            .route(URL_A, vec![Reply::Ok("<html>maintenance</html>".into())])
            .route(URL_B, vec![Reply::Ok(SITE_B_JSON.into())]),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport.clone());

    let r = coord.run("news", date()).await.unwrap();

    assert_eq!(r.provider_status["site_a"], FetchStatus::FatalError);
    assert!(r.provider_errors["site_a"].contains("malformed"));
    assert_eq!(r.provider_stats["site_a"].errors, 1);
    assert!(r.partial_success);
    assert_eq!(transport.calls(URL_A), 1);
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let transport = Arc::new(
        MockTransport::new()
            .route(URL_A, vec![Reply::Status(404)])
            .route(
                URL_B,
                vec![
                    Reply::Error(TransportError::Connect("reset".into())),
                    Reply::Ok(SITE_B_JSON.into()),
                ],
            ),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport.clone());

    let r = coord.run("news", date()).await.unwrap();

    assert_eq!(r.provider_status["site_a"], FetchStatus::HttpError(404));
    assert_eq!(transport.calls(URL_A), 1);
    assert_eq!(r.provider_status["site_b"], FetchStatus::Success);
    assert_eq!(transport.calls(URL_B), 2);
}

#[tokio::test]
async fn rss_provider_is_mapped_through_formats() {
    let wire = site(
        "logistics",
        vec![provider("wire", URL_RSS), provider("site_a", URL_A)],
    );
    let transport = Arc::new(
        MockTransport::new()
            .route(URL_RSS, vec![Reply::Ok(FEED_XML.into())])
            .route(URL_A, vec![Reply::Status(503)]),
    );
    let coord = coordinator(&fast_config(vec![wire]), transport);

    let r = coord.run("logistics", date()).await.unwrap();

    assert_eq!(r.provider_status["wire"], FetchStatus::Success);
    assert_eq!(r.provider_status["site_a"], FetchStatus::HttpError(503));
    assert_eq!(r.records.len(), 2);
    assert!(r.records.iter().all(|x| x.fields.supplier == "Logistics Wire"));
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let transport = Arc::new(
        MockTransport::new()
            .route(URL_A, vec![Reply::Ok(SITE_A_JSON.into())])
            .route(URL_B, vec![Reply::Ok(SITE_B_JSON.into())]),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport.clone());

    let first = coord.run("news", date()).await.unwrap();
    let second = coord.run("news", date()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(transport.calls(URL_A), 1);
    assert_eq!(transport.calls(URL_B), 1);
    assert_eq!(coord.cache().stats().builds, 1);
}

#[tokio::test]
async fn concurrent_runs_fetch_each_provider_once() {
    let transport = Arc::new(
        MockTransport::new()
            .route(
                URL_A,
                vec![Reply::Slow(Duration::from_millis(50), SITE_A_JSON.into())],
            )
            .route(
                URL_B,
                vec![Reply::Slow(Duration::from_millis(50), SITE_B_JSON.into())],
            ),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport.clone());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coord = coord.clone();
        handles.push(tokio::spawn(async move { coord.run("news", date()).await }));
    }
    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap().unwrap());
    }

    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(transport.calls(URL_A), 1);
    assert_eq!(transport.calls(URL_B), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_returns_partial_result_and_skips_cache() {
    let transport = Arc::new(
        MockTransport::new()
            .route(URL_A, vec![Reply::Hang])
            .route(URL_B, vec![Reply::Ok(SITE_B_JSON.into())]),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport);

    let shutdown = tokio::time::sleep(Duration::from_millis(300));
    let r = coord.run_until("news", date(), shutdown).await.unwrap();

    assert_eq!(r.provider_status["site_a"], FetchStatus::TransientError);
    assert_eq!(r.provider_status["site_b"], FetchStatus::Success);
    assert!(r.partial_success);
    assert!(coord.cache().get("news", date()).await.is_none());
}

#[tokio::test]
async fn unknown_and_disabled_sites_are_errors() {
    let mut off = site("archive", vec![provider("site_a", URL_A)]);
    off.enabled = false;
    let transport = Arc::new(MockTransport::new());
    let coord = coordinator(&fast_config(vec![news_site(), off]), transport.clone());

    assert_eq!(
        coord.run("missing", date()).await.unwrap_err(),
        CoordinatorError::NotFound("missing".into())
    );
    assert_eq!(
        coord.run("archive", date()).await.unwrap_err(),
        CoordinatorError::Disabled("archive".into())
    );
    assert_eq!(transport.calls(URL_A), 0);
}

#[tokio::test]
async fn reload_swaps_sites_for_next_run() {
    let transport = Arc::new(
        MockTransport::new().route(URL_B, vec![Reply::Ok(SITE_B_JSON.into())]),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport);

    let n = coord
        .reload_sites(vec![site("sports", vec![provider("site_b", URL_B)])])
        .unwrap();
    assert_eq!(n, 1);
    assert!(coord.run("news", date()).await.is_err());
    let r = coord.run("sports", date()).await.unwrap();
    assert!(!r.partial_success && !r.total_failure);

    // Unmapped providers are rejected and the old snapshot stays.
    assert!(coord
        .reload_sites(vec![site("x", vec![provider("nope", URL_A)])])
        .is_err());
    assert!(coord.resolve_enabled("sports").is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_bounds_concurrent_provider_fetches() {
    for pool_size in [1usize, 2] {
        let ids: Vec<String> = (1..=5).map(|i| format!("p{i}")).collect();
        let providers = ids
            .iter()
            .map(|id| provider(id, &format!("http://{id}.test/feed")))
            .collect();
        let mut cfg = fast_config(vec![site("wide", providers)]);
        cfg.worker.pool_size = pool_size;
        for id in &ids {
            cfg.formats.insert(id.clone(), "site_a".to_string());
        }
        let transport = Arc::new(Gauged::default());
        let coord = site_aggregator::JobCoordinator::from_config_with_store(
            &cfg,
            transport.clone(),
            Arc::new(site_aggregator::MemoryStore::new()),
        )
        .unwrap();

        let r = coord.run("wide", date()).await.unwrap();

        let peak = transport.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= pool_size, "pool {pool_size} saw {peak} concurrent fetches");
        assert_eq!(transport.total.load(Ordering::SeqCst), 5);
        assert_eq!(r.provider_status.len(), 5);
        for id in &ids {
            assert_eq!(r.provider_status[id.as_str()], FetchStatus::Success, "{id}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn waiter_stops_on_its_own_shutdown_while_build_continues() {
    let transport = Arc::new(
        MockTransport::new()
            .route(URL_A, vec![Reply::Hang])
            .route(URL_B, vec![Reply::Ok(SITE_B_JSON.into())]),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport);

    let leader = {
        let coord = coord.clone();
        tokio::spawn(async move { coord.run("news", date()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let waited = tokio::time::timeout(
        Duration::from_secs(1),
        coord.run_until("news", date(), tokio::time::sleep(Duration::from_millis(50))),
    )
    .await
    .expect("waiter returns once its shutdown fires");
    assert!(matches!(waited, Err(CoordinatorError::Cancelled(_))), "{waited:?}");

    let r = leader.await.unwrap().unwrap();
    assert_eq!(r.provider_status["site_a"], FetchStatus::Timeout);
    assert_eq!(coord.cache().stats().builds, 1);
    assert!(coord.cache().get("news", date()).await.is_some());
}
