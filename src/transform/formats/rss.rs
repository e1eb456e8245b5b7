// src/transform/formats/rss.rs
use chrono::{TimeZone, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use super::Parsed;
use crate::transform::normalize_text;
use crate::types::RecordFields;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<chrono::DateTime<Utc>> {
    let secs = OffsetDateTime::parse(ts.trim(), &Rfc2822).ok()?.unix_timestamp();
    Utc.timestamp_opt(secs, 0).single()
}

/// RSS 2.0; the channel title is the supplier and item order is the rank.
pub fn parse(payload: &str) -> Result<Parsed, String> {
    let xml_clean = scrub_html_entities_for_xml(payload);
    let rss: Rss = from_str(&xml_clean).map_err(|e| format!("parsing rss xml: {e}"))?;

    let supplier = rss
        .channel
        .title
        .as_deref()
        .map(normalize_text)
        .unwrap_or_default();

    let fetched = rss.channel.item.len();
    let mut fields = Vec::with_capacity(fetched);
    for (idx, it) in rss.channel.item.into_iter().enumerate() {
        let title = normalize_text(it.title.as_deref().unwrap_or_default());
        let title = if title.is_empty() {
            normalize_text(it.description.as_deref().unwrap_or_default())
        } else {
            title
        };
        if title.is_empty() {
            continue;
        }
        let external_id = it
            .guid
            .clone()
            .or_else(|| it.link.clone())
            .unwrap_or_else(|| title.clone());
        fields.push(RecordFields {
            external_id,
            title,
            supplier: supplier.clone(),
            status: "published".to_string(),
            confirmed: true,
            published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
            rank: u32::try_from(idx + 1).ok(),
            url: it.link,
        });
    }
    Ok(Parsed { fetched, fields })
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Supplier Wire</title>
    <item>
      <title>Plant reopens&nbsp;after audit</title>
      <link>https://wire.test/1</link>
      <pubDate>Sat, 10 May 2025 09:30:00 +0000</pubDate>
    </item>
    <item>
      <title></title>
      <description>Only a description here.</description>
    </item>
    <item>
      <title> </title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_items_in_order() {
        let p = parse(FEED).unwrap();
        assert_eq!(p.fetched, 3);
        assert_eq!(p.fields.len(), 2);
        assert_eq!(p.fields[0].title, "Plant reopens after audit");
        assert_eq!(p.fields[0].supplier, "Supplier Wire");
        assert_eq!(p.fields[0].rank, Some(1));
        assert_eq!(p.fields[0].external_id, "https://wire.test/1");
        assert!(p.fields[0].published_at.is_some());
        assert_eq!(p.fields[1].title, "Only a description here");
        assert_eq!(p.fields[1].rank, Some(2));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(parse("<html><body>503</body></html>").is_err());
    }
}
