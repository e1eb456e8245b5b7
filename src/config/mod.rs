// src/config/mod.rs
//! Application configuration: worker/retry/cache knobs, scoring weights,
//! provider formats and the site declarations.
//!
//! Lookup order for the file:
//! 1) $SITES_CONFIG_PATH
//! 2) config/sites.toml
//! 3) config/sites.json
//! 4) built-in default (`news` site with `site_a` + `site_b`)

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::scoring::ScoringWeights;
use crate::sites::{DateStrategy, ProviderDecl, SiteConfig, SiteRegistry};
use crate::transform::TransformerRegistry;

pub const ENV_PATH: &str = "SITES_CONFIG_PATH";

const TIMEOUT_RANGE: (u64, u64) = (1, 10);
const RETRIES_RANGE: (u32, u32) = (1, 10);

fn default_timeout_secs() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_pool_size() -> usize {
    8
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8_000
}
fn default_true() -> bool {
    true
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache/aggregates")
}
fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Per-attempt timeout, clamped to [1,10].
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first attempt, clamped to [1,10].
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Max provider fetches in flight across all runs.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            pool_size: default_pool_size(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.clamp(TIMEOUT_RANGE.0, TIMEOUT_RANGE.1))
    }

    pub fn retries(&self) -> u32 {
        self.max_retries.clamp(RETRIES_RANGE.0, RETRIES_RANGE.1)
    }

    /// Clamp out-of-range values in place, warning about each one.
    pub fn sanitize(&mut self) {
        let t = self.timeout_secs.clamp(TIMEOUT_RANGE.0, TIMEOUT_RANGE.1);
        if t != self.timeout_secs {
            warn!(from = self.timeout_secs, to = t, "worker.timeout_secs out of range, clamped");
            self.timeout_secs = t;
        }
        let r = self.retries();
        if r != self.max_retries {
            warn!(from = self.max_retries, to = r, "worker.max_retries out of range, clamped");
            self.max_retries = r;
        }
        if self.pool_size == 0 {
            warn!("worker.pool_size = 0, using 1");
            self.pool_size = 1;
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            self.backoff_max_ms = self.backoff_base_ms;
        }
    }
}

/// Which HTTP statuses count as retryable. 4xx other than the listed ones
/// are always fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub retry_on_server_errors: bool,
    #[serde(default)]
    pub retry_on_429: bool,
    #[serde(default)]
    pub extra_retry_status: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_on_server_errors: true,
            retry_on_429: false,
            extra_retry_status: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            backend: CacheBackend::default(),
            dir: default_cache_dir(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scoring: ScoringWeights,
    #[serde(default)]
    pub server: ServerConfig,
    /// Extra `provider id → format` entries on top of the built-ins.
    #[serde(default)]
    pub formats: HashMap<String, String>,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
    /// File this config came from; `None` for the built-in default.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            scoring: ScoringWeights::default(),
            server: ServerConfig::default(),
            formats: HashMap::new(),
            sites: vec![default_news_site()],
            source: None,
        }
    }
}

/// The `news` site fed by the two built-in providers.
pub fn default_news_site() -> SiteConfig {
    SiteConfig {
        site_id: "news".to_string(),
        date_strategy: DateStrategy::Today,
        custom_date: None,
        enabled: true,
        providers: vec![
            ProviderDecl {
                id: "site_a".to_string(),
                url: "http://a.com".to_string(),
            },
            ProviderDecl {
                id: "site_b".to_string(),
                url: "http://b.com".to_string(),
            },
        ],
        description: "Default news site".to_string(),
    }
}

impl AppConfig {
    /// Load from an explicit path. TOML or JSON, chosen by extension.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg = parse(&content, &ext).map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })?;
        cfg.source = Some(path.to_path_buf());
        cfg.worker.sanitize();
        if cfg.sites.is_empty() {
            warn!(path = %path.display(), "config declares no sites");
        }
        info!(path = %path.display(), sites = cfg.sites.len(), "config loaded");
        Ok(cfg)
    }

    /// Load using the env var and fallbacks, then apply env overrides.
    pub fn load_default() -> Result<Self, ConfigError> {
        let mut cfg = Self::locate()?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn locate() -> Result<Self, ConfigError> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(&p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(ConfigError::MissingPath(ENV_PATH, p));
        }
        for fallback in ["config/sites.toml", "config/sites.json"] {
            let pb = PathBuf::from(fallback);
            if pb.exists() {
                return Self::load_from(&pb);
            }
        }
        info!("no site config file found, using built-in default");
        Ok(Self::default())
    }

    /// `HTTP_TIMEOUT`, `HTTP_RETRIES`, `CACHE_TTL_SECS`, `BIND_ADDR`.
    /// Unparsable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u64>("HTTP_TIMEOUT") {
            self.worker.timeout_secs = v;
        }
        if let Some(v) = env_parse::<u32>("HTTP_RETRIES") {
            self.worker.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("CACHE_TTL_SECS") {
            self.cache.ttl_secs = v;
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            if !v.trim().is_empty() {
                self.server.bind_addr = v.trim().to_string();
            }
        }
        self.worker.sanitize();
    }

    pub fn transformers(&self) -> Result<TransformerRegistry, ConfigError> {
        TransformerRegistry::with_overrides(&self.formats)
    }

    pub fn site_registry(&self, transformers: &TransformerRegistry) -> Result<SiteRegistry, ConfigError> {
        SiteRegistry::new(self.sites.clone(), transformers)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable env override");
            None
        }
    }
}

fn parse(s: &str, hint_ext: &str) -> Result<AppConfig, String> {
    match hint_ext {
        "toml" => toml::from_str(s).map_err(|e| e.to_string()),
        "json" => serde_json::from_str(s).map_err(|e| e.to_string()),
        _ => match toml::from_str(s) {
            Ok(v) => Ok(v),
            Err(te) => serde_json::from_str(s).map_err(|je| format!("not TOML ({te}) nor JSON ({je})")),
        },
    }
}
