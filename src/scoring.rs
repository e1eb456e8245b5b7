//! Record scoring.
//!
//! `ScoreInputs` are four normalized signals in [0,1]:
//! - `recency`   : how close `published_at` is to the end of the target date
//! - `rank`      : provider-declared position (1 / rank)
//! - `quality`   : title length and supplier presence
//! - `confirmed` : the provider marked the item as confirmed
//!
//! score = Σ w_i * signal_i / Σ w_i, clamped to [0,1] and rounded to 6 decimals
//! so equal fields always compare equal.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::RecordFields;

/// Title length (chars) at which the length signal saturates.
const TITLE_SATURATION: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_w_recency")]
    pub recency: f64,
    #[serde(default = "default_w_rank")]
    pub rank: f64,
    #[serde(default = "default_w_quality")]
    pub quality: f64,
    #[serde(default = "default_w_confirmed")]
    pub confirmed: f64,
    /// Age (hours) at which the recency signal reaches zero.
    #[serde(default = "default_horizon")]
    pub recency_horizon_hours: f64,
}

fn default_w_recency() -> f64 {
    0.4
}
fn default_w_rank() -> f64 {
    0.3
}
fn default_w_quality() -> f64 {
    0.2
}
fn default_w_confirmed() -> f64 {
    0.1
}
fn default_horizon() -> f64 {
    48.0
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            recency: default_w_recency(),
            rank: default_w_rank(),
            quality: default_w_quality(),
            confirmed: default_w_confirmed(),
            recency_horizon_hours: default_horizon(),
        }
    }
}

/// Normalized inputs in [0,1].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoreInputs {
    pub recency: f64,
    pub rank: f64,
    pub quality: f64,
    pub confirmed: f64,
}

impl ScoreInputs {
    /// Safe constructor with clamping.
    pub fn new(recency: f64, rank: f64, quality: f64, confirmed: f64) -> Self {
        fn c(x: f64) -> f64 {
            if x.is_nan() {
                0.0
            } else {
                x.clamp(0.0, 1.0)
            }
        }
        Self {
            recency: c(recency),
            rank: c(rank),
            quality: c(quality),
            confirmed: c(confirmed),
        }
    }
}

/// Weighted combination, normalized by the sum of (non-negative) weights.
pub fn weighted_score(inputs: &ScoreInputs, w: &ScoringWeights) -> f64 {
    let (wr, wk, wq, wc) = (
        w.recency.max(0.0),
        w.rank.max(0.0),
        w.quality.max(0.0),
        w.confirmed.max(0.0),
    );
    let raw = inputs.recency * wr + inputs.rank * wk + inputs.quality * wq + inputs.confirmed * wc;
    let denom = (wr + wk + wq + wc).max(1e-9);
    round6((raw / denom).clamp(0.0, 1.0))
}

fn round6(x: f64) -> f64 {
    (x * 1_000_000.0).round() / 1_000_000.0
}

/// Scores records for one target date. Pure: same fields and date give the same score.
#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScoringWeights,
    reference: DateTime<Utc>,
}

impl Scorer {
    /// Recency is measured against the last second of `date` (UTC).
    pub fn for_date(weights: ScoringWeights, date: NaiveDate) -> Self {
        let reference = date
            .and_hms_opt(23, 59, 59)
            .map(|dt| Utc.from_utc_datetime(&dt))
            .unwrap_or_else(|| Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)));
        Self { weights, reference }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn inputs(&self, fields: &RecordFields) -> ScoreInputs {
        let recency = match fields.published_at {
            Some(ts) => {
                let age_h = (self.reference - ts).num_seconds().max(0) as f64 / 3600.0;
                let horizon = self.weights.recency_horizon_hours.max(1e-9);
                1.0 - age_h / horizon
            }
            None => 0.0,
        };
        let rank = match fields.rank {
            Some(r) => 1.0 / f64::from(r.max(1)),
            None => 0.0,
        };
        let title_len = fields.title.chars().count().min(TITLE_SATURATION) as f64;
        let supplier = if fields.supplier.trim().is_empty() { 0.0 } else { 1.0 };
        let quality = 0.7 * (title_len / TITLE_SATURATION as f64) + 0.3 * supplier;
        let confirmed = if fields.confirmed { 1.0 } else { 0.0 };
        ScoreInputs::new(recency, rank, quality, confirmed)
    }

    pub fn score(&self, fields: &RecordFields) -> f64 {
        weighted_score(&self.inputs(fields), &self.weights)
    }
}
