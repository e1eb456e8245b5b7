// src/sites.rs
//! Site registry: validated, immutable snapshot of the declared sites and the
//! handle used to swap snapshots between coordinator runs.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConfigError, CoordinatorError};
use crate::transform::TransformerRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateStrategy {
    #[default]
    Today,
    Yesterday,
    Custom,
}

/// One provider of a site. Declaration order inside the site is significant:
/// it breaks score ties during merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDecl {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub site_id: String,
    #[serde(default)]
    pub date_strategy: DateStrategy,
    #[serde(default)]
    pub custom_date: Option<NaiveDate>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub providers: Vec<ProviderDecl>,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

impl SiteConfig {
    /// Target date for a run started at `now`.
    pub fn effective_date(&self, now: DateTime<Utc>) -> NaiveDate {
        let today = now.date_naive();
        match self.date_strategy {
            DateStrategy::Today => today,
            DateStrategy::Yesterday => today.checked_sub_days(Days::new(1)).unwrap_or(today),
            // Validated at load; a snapshot never holds custom without a date.
            DateStrategy::Custom => self.custom_date.unwrap_or(today),
        }
    }

    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.id.as_str())
    }

    /// Position of `provider_id` in declaration order.
    pub fn declaration_index(&self, provider_id: &str) -> Option<usize> {
        self.providers.iter().position(|p| p.id == provider_id)
    }
}

/// Validated set of sites. Never mutated after construction.
#[derive(Debug, Default)]
pub struct SiteRegistry {
    sites: Vec<Arc<SiteConfig>>,
}

impl SiteRegistry {
    /// Validate `sites` against the transformer table and build a snapshot.
    pub fn new(
        sites: Vec<SiteConfig>,
        transformers: &TransformerRegistry,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for site in &sites {
            validate_site(site, transformers)?;
            if !seen.insert(site.site_id.as_str()) {
                return Err(ConfigError::DuplicateSite(site.site_id.clone()));
            }
        }
        info!(target: "sites", sites = sites.len(), "site registry loaded");
        Ok(Self {
            sites: sites.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn resolve(&self, site_id: &str) -> Result<Arc<SiteConfig>, CoordinatorError> {
        self.sites
            .iter()
            .find(|s| s.site_id == site_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(site_id.to_string()))
    }

    /// Every site in declaration order, enabled or not.
    pub fn list_all(&self) -> Vec<Arc<SiteConfig>> {
        self.sites.clone()
    }

    pub fn list_enabled(&self) -> Vec<Arc<SiteConfig>> {
        self.sites.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

fn validate_site(site: &SiteConfig, transformers: &TransformerRegistry) -> Result<(), ConfigError> {
    if site.site_id.trim().is_empty() {
        return Err(ConfigError::EmptySiteId);
    }
    if site.providers.is_empty() {
        return Err(ConfigError::NoProviders(site.site_id.clone()));
    }
    if site.date_strategy == DateStrategy::Custom && site.custom_date.is_none() {
        return Err(ConfigError::MissingCustomDate(site.site_id.clone()));
    }

    let mut ids = HashSet::new();
    for p in &site.providers {
        if !ids.insert(p.id.as_str()) {
            return Err(ConfigError::DuplicateProvider {
                site: site.site_id.clone(),
                provider: p.id.clone(),
            });
        }
        let scheme_ok = reqwest::Url::parse(&p.url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !scheme_ok {
            return Err(ConfigError::InvalidUrl {
                site: site.site_id.clone(),
                provider: p.id.clone(),
                url: p.url.clone(),
            });
        }
        if !transformers.is_mapped(&p.id) {
            return Err(ConfigError::UnmappedProvider {
                site: site.site_id.clone(),
                provider: p.id.clone(),
            });
        }
    }
    if site.date_strategy != DateStrategy::Custom && site.custom_date.is_some() {
        warn!(
            target: "sites",
            site = %site.site_id,
            "custom_date is ignored unless date_strategy = custom"
        );
    }
    Ok(())
}

/// Shared handle to the current site snapshot.
///
/// Runs take one snapshot and keep it for their whole duration; `replace`
/// swaps in a new snapshot for subsequent runs.
#[derive(Clone, Debug)]
pub struct SiteRegistryHandle {
    inner: Arc<RwLock<Arc<SiteRegistry>>>,
}

impl SiteRegistryHandle {
    pub fn new(registry: SiteRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    pub fn snapshot(&self) -> Arc<SiteRegistry> {
        match self.inner.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn replace(&self, registry: SiteRegistry) {
        let fresh = Arc::new(registry);
        match self.inner.write() {
            Ok(mut g) => *g = fresh,
            Err(poison) => *poison.into_inner() = fresh,
        }
    }
}
