//! Shared vocabulary for the kiln build cache and scheduler.
//!
//! This crate defines the types every other kiln crate speaks in:
//!
//! - [`Uid`]: opaque stable identifier for a build task's output set
//! - [`ContentHash`]: SHA-256 content address of an immutable blob
//! - [`OutputManifest`]: the relative-path to blob mapping published per uid
//! - [`CacheTier`]: the capability trait all cache backends implement
//! - [`CancelToken`]: cooperative process-wide cancellation
//! - [`TierCounters`]: per-operation telemetry counters shared by every tier

pub mod cancel;
pub mod codec;
pub mod error;
pub mod hashio;
pub mod id;
pub mod manifest;
pub mod stats;
pub mod tier;

pub use cancel::{CancelToken, Cancelled};
pub use codec::Codec;
pub use error::{Error, Result};
pub use id::{ContentHash, Uid};
pub use manifest::{FileEntry, OutputManifest};
pub use stats::{OpKind, TierCounters, TierStatsSnapshot};
pub use tier::{CacheTier, PathFilter, TierProbe};
