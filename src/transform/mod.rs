// src/transform/mod.rs
//! Transformer registry: provider id → payload format → unified records.
//!
//! The mapping is a table lookup resolved when the site registry is built.
//! Payload inspection never decides which normalizer runs.

pub mod formats;

use std::collections::HashMap;
use std::str::FromStr;

use metrics::counter;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ConfigError, TransformError};
use crate::scoring::Scorer;
use crate::types::{RecordFields, UnifiedRecord};

/// Closed set of payload shapes the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// JSON array of items (`id`, `title`, `supplier`, `receivedAt`, ...).
    SiteA,
    /// JSON object with an `items` array (`ref`, `headline`, `vendor`, `timestamp`, ...).
    SiteB,
    /// RSS 2.0 channel.
    Rss,
}

impl FromStr for PayloadFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "site_a" => Ok(PayloadFormat::SiteA),
            "site_b" => Ok(PayloadFormat::SiteB),
            "rss" => Ok(PayloadFormat::Rss),
            other => Err(ConfigError::UnknownFormat(other.to_string())),
        }
    }
}

impl PayloadFormat {
    fn parse(self, payload: &str) -> Result<formats::Parsed, String> {
        match self {
            PayloadFormat::SiteA => formats::site_a::parse(payload),
            PayloadFormat::SiteB => formats::site_b::parse(payload),
            PayloadFormat::Rss => formats::rss::parse(payload),
        }
    }
}

/// Records produced from one provider payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformBatch {
    /// Items present in the payload, including ones dropped as empty.
    pub fetched: usize,
    pub records: Vec<UnifiedRecord>,
}

#[derive(Debug, Clone)]
pub struct TransformerRegistry {
    table: HashMap<String, PayloadFormat>,
}

impl TransformerRegistry {
    /// Built-in providers.
    pub fn builtin() -> Self {
        let mut table = HashMap::new();
        table.insert("site_a".to_string(), PayloadFormat::SiteA);
        table.insert("site_b".to_string(), PayloadFormat::SiteB);
        Self { table }
    }

    /// Built-ins plus `provider id → format name` entries from configuration.
    pub fn with_overrides(entries: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut reg = Self::builtin();
        for (provider, format) in entries {
            reg.register(provider, format.parse()?);
        }
        Ok(reg)
    }

    pub fn register(&mut self, provider_id: &str, format: PayloadFormat) {
        self.table.insert(provider_id.to_string(), format);
    }

    pub fn format_for(&self, provider_id: &str) -> Option<PayloadFormat> {
        self.table.get(provider_id).copied()
    }

    pub fn is_mapped(&self, provider_id: &str) -> bool {
        self.table.contains_key(provider_id)
    }

    /// Normalize and score one provider payload. Any structural failure fails
    /// the whole payload; there is no partial list.
    pub fn transform(
        &self,
        provider_id: &str,
        raw_payload: &str,
        scorer: &Scorer,
    ) -> Result<TransformBatch, TransformError> {
        let format = self
            .format_for(provider_id)
            .ok_or_else(|| TransformError::Unmapped(provider_id.to_string()))?;

        let parsed = format.parse(raw_payload).map_err(|message| {
            counter!("transform_errors_total", "provider" => provider_id.to_string()).increment(1);
            TransformError::Malformed {
                provider: provider_id.to_string(),
                message,
            }
        })?;

        let records = parsed
            .fields
            .into_iter()
            .map(|fields| UnifiedRecord {
                record_key: record_key(&fields),
                score: scorer.score(&fields),
                source_provider_id: provider_id.to_string(),
                fields,
            })
            .collect();

        Ok(TransformBatch {
            fetched: parsed.fetched,
            records,
        })
    }
}

/// Stable identity from provider-independent content: supplier + title.
pub fn record_key(fields: &RecordFields) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fields.supplier.to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(fields.title.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(24);
    for b in digest.iter().take(12) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Max chars kept from any normalized text field.
const MAX_TEXT_CHARS: usize = 500;

/// Normalize text: decode entities, strip tags, ASCII quotes, collapse whitespace,
/// drop trailing sentence punctuation, cap length.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',') {
            out.pop();
        } else {
            break;
        }
    }

    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}
