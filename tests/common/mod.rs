// tests/common/mod.rs
//
// Shared helpers for integration tests: a scripted provider transport keyed by
// URL, payload fixtures, and coordinator wiring with fast retry settings.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use site_aggregator::fetch::{TransportError, TransportResponse};
use site_aggregator::{
    AppConfig, DateStrategy, JobCoordinator, MemoryStore, ProviderDecl, ProviderTransport,
    SiteConfig,
};

pub const SITE_A_JSON: &str = include_str!("../fixtures/site_a.json");
pub const SITE_B_JSON: &str = include_str!("../fixtures/site_b.json");
pub const FEED_XML: &str = include_str!("../fixtures/feed.xml");

pub const URL_A: &str = "http://a.test/feed";
pub const URL_B: &str = "http://b.test/feed";
pub const URL_RSS: &str = "http://wire.test/rss";

#[derive(Clone, Debug)]
pub enum Reply {
    Ok(String),
    Status(u16),
    Error(TransportError),
    /// Answer 200 with the body after a delay.
    Slow(Duration, String),
    /// Never answer.
    Hang,
}

/// Replays a script per URL; the last reply repeats once the script runs out.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    last: Mutex<HashMap<String, Reply>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
        self
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn next(&self, url: &str) -> Reply {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(r) => {
                self.last.lock().unwrap().insert(url.to_string(), r.clone());
                r
            }
            None => self
                .last
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .unwrap_or(Reply::Error(TransportError::Connect(format!("no route for {url}")))),
        }
    }
}

#[async_trait]
impl ProviderTransport for MockTransport {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<TransportResponse, TransportError> {
        match self.next(url) {
            Reply::Ok(body) => Ok(TransportResponse { status: 200, body }),
            Reply::Status(status) => Ok(TransportResponse {
                status,
                body: format!("status {status}"),
            }),
            Reply::Error(e) => Err(e),
            Reply::Slow(d, body) => {
                tokio::time::sleep(d).await;
                Ok(TransportResponse { status: 200, body })
            }
            Reply::Hang => std::future::pending().await,
        }
    }
}

pub fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 5, 10).unwrap()
}

pub fn provider(id: &str, url: &str) -> ProviderDecl {
    ProviderDecl {
        id: id.to_string(),
        url: url.to_string(),
    }
}

pub fn site(id: &str, providers: Vec<ProviderDecl>) -> SiteConfig {
    SiteConfig {
        site_id: id.to_string(),
        date_strategy: DateStrategy::Today,
        custom_date: None,
        enabled: true,
        providers,
        description: String::new(),
    }
}

/// The `news` site over the two built-in providers, pointed at the mock URLs.
pub fn news_site() -> SiteConfig {
    site(
        "news",
        vec![provider("site_a", URL_A), provider("site_b", URL_B)],
    )
}

/// 1s timeout, one retry, no backoff sleeps.
pub fn fast_config(sites: Vec<SiteConfig>) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.sites = sites;
    cfg.worker.timeout_secs = 1;
    cfg.worker.max_retries = 1;
    cfg.worker.backoff_base_ms = 0;
    cfg.worker.backoff_max_ms = 0;
    cfg.formats.insert("wire".to_string(), "rss".to_string());
    cfg
}

pub fn coordinator(cfg: &AppConfig, transport: Arc<MockTransport>) -> Arc<JobCoordinator> {
    Arc::new(
        JobCoordinator::from_config_with_store(cfg, transport, Arc::new(MemoryStore::new()))
            .expect("valid test config"),
    )
}
