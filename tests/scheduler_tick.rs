// tests/scheduler_tick.rs
mod common;

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use common::*;
use site_aggregator::scheduler;
use site_aggregator::DateStrategy;

#[tokio::test]
async fn tick_runs_enabled_sites_for_their_effective_date() {
    let mut yesterday = site("markets", vec![provider("site_b", URL_B)]);
    yesterday.date_strategy = DateStrategy::Yesterday;
    let mut off = site("archive", vec![provider("site_a", URL_A)]);
    off.enabled = false;

    let transport = Arc::new(
        MockTransport::new()
            .route(URL_A, vec![Reply::Status(500)])
            .route(URL_B, vec![Reply::Ok(SITE_B_JSON.into())]),
    );
    let coord = coordinator(
        &fast_config(vec![news_site(), yesterday, off]),
        transport.clone(),
    );

    let now = Utc.with_ymd_and_hms(2025, 5, 11, 0, 0, 0).unwrap();
    let report = scheduler::tick_once(&coord, now).await;

    assert_eq!(report.runs(), 2);
    assert_eq!(report.partial, vec!["news".to_string()]);
    assert_eq!(report.succeeded, vec!["markets".to_string()]);
    assert!(report.errored.is_empty());

    let may_10 = NaiveDate::from_ymd_opt(2025, 5, 10).unwrap();
    let may_11 = NaiveDate::from_ymd_opt(2025, 5, 11).unwrap();
    assert!(coord.cache().get("markets", may_10).await.is_some());
    assert!(coord.cache().get("news", may_11).await.is_some());
    assert!(coord.cache().get("archive", may_11).await.is_none());
}

#[tokio::test]
async fn repeated_tick_within_ttl_hits_cache() {
    let transport = Arc::new(
        MockTransport::new()
            .route(URL_A, vec![Reply::Ok(SITE_A_JSON.into())])
            .route(URL_B, vec![Reply::Ok(SITE_B_JSON.into())]),
    );
    let coord = coordinator(&fast_config(vec![news_site()]), transport.clone());
    let now = Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap();

    scheduler::tick_once(&coord, now).await;
    let second = scheduler::tick_once(&coord, now).await;

    assert_eq!(second.succeeded, vec!["news".to_string()]);
    assert_eq!(transport.calls(URL_A), 1);
    assert_eq!(coord.cache().stats().hits, 1);
}

#[tokio::test]
async fn control_reports_next_aligned_slot_only_while_running() {
    let transport = Arc::new(MockTransport::new());
    let coord = coordinator(&fast_config(vec![news_site()]), transport);
    let control = scheduler::SchedulerControl::new(coord, scheduler::SchedulerCfg::default());
    let now = Utc.with_ymd_and_hms(2025, 5, 10, 10, 45, 30).unwrap();

    assert!(!control.is_running());
    assert_eq!(control.next_run(now), None);

    assert!(control.start());
    assert!(control.is_running());
    assert_eq!(
        control.next_run(now),
        Some(Utc.with_ymd_and_hms(2025, 5, 10, 11, 0, 0).unwrap())
    );
    assert!(control.last_tick().is_none());

    assert!(control.stop());
    assert!(!control.stop());
    assert_eq!(control.status(now).next_run, None);
}
