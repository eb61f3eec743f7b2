//! The local disk cache tier for kiln.
//!
//! Outputs are stored as content-addressed blobs plus per-uid manifests,
//! with an append-only usage journal driving least-recently-used
//! eviction. [`LocalCacheTier`] ties the three together and implements
//! the shared [`CacheTier`](kiln_core::CacheTier) trait; [`compact`] and
//! [`strip`] are the two eviction strategies, and [`StoreConfig`]
//! resolves where on disk the store lives.

pub mod cas;
pub mod compact;
pub mod config;
pub mod error;
pub mod local;
pub mod lru;
pub mod meta;

pub use cas::{BlobStore, GcSummary, StoredBlob};
pub use compact::{compact, strip, CompactSummary, StripSummary};
pub use config::{resolve_store_root, StoreConfig};
pub use error::{Error, Result};
pub use local::{IntegrityReport, LocalCacheTier};
pub use lru::{hash_key, uid_key, LruIndex, SieveDecision, SieveSummary};
pub use meta::UidStore;
