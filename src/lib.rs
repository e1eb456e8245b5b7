// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregate;
pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod jobs;
pub mod metrics;
pub mod scheduler;
pub mod scoring;
pub mod sites;
pub mod transform;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::cache::{BuildOutcome, CacheManager, CacheStore, FileStore, MemoryStore};
pub use crate::config::AppConfig;
pub use crate::coordinator::JobCoordinator;
pub use crate::error::{CacheError, ConfigError, CoordinatorError, TransformError};
pub use crate::fetch::{ProviderFetcher, ProviderTransport, ReqwestTransport, RetryPolicy};
pub use crate::jobs::{JobState, JobTracker};
pub use crate::sites::{DateStrategy, ProviderDecl, SiteConfig, SiteRegistry, SiteRegistryHandle};
pub use crate::types::{AggregateResult, FetchOutcome, FetchStatus, ProviderStats, UnifiedRecord};
