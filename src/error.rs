// src/error.rs
//! Error taxonomy of the aggregation engine.
//!
//! Provider-level failures never show up here as errors: fetch failures are
//! data ([`crate::types::FetchStatus`]) and transform failures are downgraded
//! to a fatal provider outcome. Only configuration, cache-store and
//! coordinator-level problems are typed errors.

use thiserror::Error;

/// Bad or missing site/provider declarations. Fatal to configuration load.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("{0} points to non-existent path {1}")]
    MissingPath(&'static str, String),

    #[error("site_id must not be empty")]
    EmptySiteId,

    #[error("duplicate site_id '{0}'")]
    DuplicateSite(String),

    #[error("site '{0}' declares no providers")]
    NoProviders(String),

    #[error("site '{site}' declares provider '{provider}' more than once")]
    DuplicateProvider { site: String, provider: String },

    #[error("site '{0}' uses the custom date strategy without custom_date")]
    MissingCustomDate(String),

    #[error("site '{site}' provider '{provider}' has invalid url '{url}'")]
    InvalidUrl {
        site: String,
        provider: String,
        url: String,
    },

    #[error("site '{site}' provider '{provider}' has no transformer")]
    UnmappedProvider { site: String, provider: String },

    #[error("unknown payload format '{0}'")]
    UnknownFormat(String),
}

/// A provider payload that failed structural validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("no transformer registered for provider '{0}'")]
    Unmapped(String),

    #[error("malformed payload from '{provider}': {message}")]
    Malformed { provider: String, message: String },
}

/// The cache store could not be reached or returned garbage.
/// Always absorbed by the cache manager (fail-open).
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("cache entry serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that escape `JobCoordinator::run`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("site '{0}' not found")]
    NotFound(String),

    #[error("site '{0}' is disabled")]
    Disabled(String),

    /// The caller stopped waiting on another caller's build of the same key.
    #[error("run cancelled: {0}")]
    Cancelled(String),

    #[error("internal coordinator error: {0}")]
    Internal(String),
}
