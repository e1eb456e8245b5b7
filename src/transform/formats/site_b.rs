// src/transform/formats/site_b.rs
use chrono::{TimeZone, Utc};
use serde::Deserialize;

use super::Parsed;
use crate::transform::normalize_text;
use crate::types::RecordFields;

#[derive(Debug, Deserialize)]
struct Envelope {
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Item {
    #[serde(rename = "ref")]
    reference: String,
    headline: String,
    #[serde(default)]
    vendor: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    is_confirmed: bool,
    /// Unix seconds.
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    position: Option<u32>,
    #[serde(default)]
    link: Option<String>,
}

/// `{"items": [ {ref, headline, vendor, state, isConfirmed, timestamp, position?, link?}, ... ]}`
pub fn parse(payload: &str) -> Result<Parsed, String> {
    let env: Envelope =
        serde_json::from_str(payload).map_err(|e| format!("expected items envelope: {e}"))?;

    let fetched = env.items.len();
    let mut fields = Vec::with_capacity(fetched);
    for it in env.items {
        let title = normalize_text(&it.headline);
        if title.is_empty() || it.reference.trim().is_empty() {
            continue;
        }
        let published_at = match it.timestamp {
            Some(ts) => Some(
                Utc.timestamp_opt(ts, 0)
                    .single()
                    .ok_or_else(|| format!("timestamp out of range: {ts}"))?,
            ),
            None => None,
        };
        fields.push(RecordFields {
            external_id: it.reference.trim().to_string(),
            title,
            supplier: normalize_text(&it.vendor),
            status: it.state.trim().to_ascii_lowercase(),
            confirmed: it.is_confirmed,
            published_at,
            rank: it.position,
            url: it.link,
        });
    }
    Ok(Parsed { fetched, fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope() {
        let payload = r#"{"items": [
            {"ref": "B-9", "headline": "Delivery on time", "vendor": "ACME LTD",
             "state": "Open", "isConfirmed": false, "timestamp": 1746864000, "position": 1}
        ]}"#;
        let p = parse(payload).unwrap();
        assert_eq!(p.fetched, 1);
        let f = &p.fields[0];
        assert_eq!(f.external_id, "B-9");
        assert_eq!(f.status, "open");
        assert_eq!(f.published_at.unwrap().timestamp(), 1_746_864_000);
    }

    #[test]
    fn bare_list_is_malformed() {
        assert!(parse("[]").is_err());
        assert!(parse(r#"{"items": [{"ref": "x"}]}"#).is_err());
    }

    #[test]
    fn out_of_range_timestamp_fails_payload() {
        let payload = r#"{"items": [{"ref": "B", "headline": "h", "timestamp": 9223372036854775807}]}"#;
        assert!(parse(payload).is_err());
    }
}
