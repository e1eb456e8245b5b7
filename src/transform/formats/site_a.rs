// src/transform/formats/site_a.rs
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::Parsed;
use crate::transform::normalize_text;
use crate::types::RecordFields;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Item {
    id: String,
    title: String,
    #[serde(default)]
    supplier: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    confirmed: bool,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    rank: Option<u32>,
    #[serde(default)]
    url: Option<String>,
}

/// `[ {id, title, supplier, status, confirmed, receivedAt, rank?, url?}, ... ]`
pub fn parse(payload: &str) -> Result<Parsed, String> {
    let items: Vec<Item> =
        serde_json::from_str(payload).map_err(|e| format!("expected JSON item list: {e}"))?;

    let fetched = items.len();
    let mut fields = Vec::with_capacity(fetched);
    for it in items {
        let title = normalize_text(&it.title);
        if title.is_empty() || it.id.trim().is_empty() {
            continue;
        }
        fields.push(RecordFields {
            external_id: it.id.trim().to_string(),
            title,
            supplier: normalize_text(&it.supplier),
            status: it.status.trim().to_ascii_lowercase(),
            confirmed: it.confirmed,
            published_at: it.received_at,
            rank: it.rank,
            url: it.url,
        });
    }
    Ok(Parsed { fetched, fields })
}
