//! kiln - distributed build result cache and task scheduler
//!
//! A build session turns declared build nodes (uid, dependencies, outputs,
//! action) into a dependency topology, drains it through a resource-aware
//! priority work queue, and short-circuits actions whose outputs are
//! already in a cache tier. Tiers form a fallback chain: local disk first,
//! then remote stores; on a miss the action runs and its outputs are
//! published back to every tier that admits them.
//!
//! # Example
//!
//! ```ignore
//! use kiln::{BuildNode, BuildSession, LocalCacheTier, SessionOptions, StoreConfig};
//!
//! fn main() -> kiln::Result<()> {
//!     let mut session = BuildSession::new(SessionOptions::new("/work"));
//!     session.add_tier(LocalCacheTier::open(&StoreConfig::default())?);
//!     session.add_node(
//!         BuildNode::new("compile")
//!             .with_output("out/lib.a")
//!             .with_action(|| {
//!                 // run the compiler
//!                 Ok(())
//!             }),
//!     );
//!     session.add_node(BuildNode::new("link").with_dep("compile"));
//!
//!     let report = session.run()?;
//!     assert!(report.success());
//!     Ok(())
//! }
//! ```

/// Session and queue configuration.
pub mod config;
/// The build session driver.
pub mod driver;
/// Driver error types.
pub mod error;
/// Build node descriptions.
pub mod node;
/// Session outcome reporting.
pub mod report;

// Re-export public API
pub use config::{QueueConfig, SessionOptions};
pub use driver::BuildSession;
pub use error::{Error, Result};
pub use node::{Action, BuildNode};
pub use report::BuildReport;

// The pieces sessions are assembled from, for single-import callers.
pub use kiln_core::{CacheTier, CancelToken, Codec, TierStatsSnapshot, Uid};
pub use kiln_remote::{ContentServiceTier, HttpStoreTier, RemoteConfig, TableStoreTier};
pub use kiln_runner::ResourceVector;
pub use kiln_store::{LocalCacheTier, StoreConfig};
