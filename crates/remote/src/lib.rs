//! Remote cache tiers
//!
//! Three [`kiln_core::CacheTier`] implementations over the network plus
//! the retry and admission machinery they share:
//!
//! - [`HttpStoreTier`] against a plain HTTP object store
//! - [`ContentServiceTier`] against an action-cache/CAS content service
//! - [`TableStoreTier`] against a key-value table, chunking large blobs
//!
//! Transient failures are retried with exponential backoff. An error that
//! survives retry disables the tier for the rest of the run: callers see
//! one `Err`, then misses, and the build keeps going on whatever tiers
//! remain healthy.

mod backend;

pub mod config;
pub mod content;
pub mod error;
pub mod http;
pub mod retry;
pub mod table;

pub use config::{AdmissionConfig, AuthConfig, RemoteConfig, RetryConfig};
pub use content::ContentServiceTier;
pub use error::{RemoteError, Result};
pub use http::HttpStoreTier;
pub use retry::retry_with_backoff;
pub use table::{
    DEFAULT_CHUNK_SIZE, MemoryTableClient, RestTableClient, TableClient, TableStoreTier,
};
