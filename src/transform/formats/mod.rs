// src/transform/formats/mod.rs
pub mod rss;
pub mod site_a;
pub mod site_b;

use crate::types::RecordFields;

/// Output of one format parser.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub fetched: usize,
    pub fields: Vec<RecordFields>,
}
