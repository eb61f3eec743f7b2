//! Dependency topology and merged-group completion tracking for kiln.
//!
//! This crate provides the completion-ordering half of the scheduler: a
//! graph of task nodes with dependency edges, union-find merged groups
//! for cyclic components, ready callbacks, and a replay log of completion
//! order for post-hoc analysis.
//!
//! # Key Types
//!
//! - [`Topology`]: the completion tracker; all mutation goes through it
//! - [`ReplayEntry`]: one completed group with its resolved dependencies
//! - [`Error`]: structural misuse errors (caller bugs, never swallowed)
//!
//! # Example
//!
//! ```
//! use kiln_topo::Topology;
//!
//! let topo = Topology::new();
//! topo.add_node("compile", ())?;
//! topo.add_node("link", ())?;
//! topo.add_deps("link", &["compile"])?;
//!
//! topo.schedule_node("compile", |()| { /* dispatch */ })?;
//! topo.schedule_node("link", |()| { /* dispatched once compile completes */ })?;
//!
//! topo.notify_dependants("compile")?;
//! topo.notify_dependants("link")?;
//! assert!(topo.get_uncompleted().is_empty());
//! # Ok::<(), kiln_topo::Error>(())
//! ```

mod error;
mod group;
mod topology;

pub use error::{Error, Result};
pub use topology::{ReplayEntry, Topology};
