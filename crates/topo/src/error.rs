//! Error types for topology operations.
//!
//! All of these indicate a caller bug in graph construction (double adds,
//! edges added too late, merges of finished groups). They are raised
//! immediately and must not be swallowed.

use miette::Diagnostic;
use thiserror::Error;

/// Result type for topology operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during topology operations.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum Error {
    /// A node with this key was already added.
    #[error("node '{key}' is already present in the topology")]
    #[diagnostic(
        code(kiln::topo::duplicate_node),
        help("every key may be added exactly once")
    )]
    DuplicateNode {
        /// The offending key.
        key: String,
    },

    /// An operation referenced a key that was never added.
    #[error("node '{key}' is not present in the topology")]
    #[diagnostic(code(kiln::topo::unknown_node))]
    UnknownNode {
        /// The missing key.
        key: String,
    },

    /// `add_deps` referenced dependency keys that were never added.
    #[error("missing dependencies: {}", keys.join(", "))]
    #[diagnostic(
        code(kiln::topo::missing_dependencies),
        help("add dependency nodes before the edges that point at them")
    )]
    MissingDependencies {
        /// The missing dependency keys.
        keys: Vec<String>,
    },

    /// Dependencies were added to, or scheduling repeated on, an already
    /// scheduled node.
    #[error("node '{key}' is already scheduled")]
    #[diagnostic(
        code(kiln::topo::already_scheduled),
        help("edges and callbacks must be attached before scheduling")
    )]
    AlreadyScheduled {
        /// The offending key.
        key: String,
    },

    /// `notify_dependants` was called twice for one node.
    #[error("node '{key}' already signalled completion")]
    #[diagnostic(code(kiln::topo::already_notified))]
    AlreadyNotified {
        /// The offending key.
        key: String,
    },

    /// The operation targeted a merged group that already completed.
    #[error("group of node '{key}' is already completed")]
    #[diagnostic(code(kiln::topo::group_completed))]
    GroupCompleted {
        /// A member key of the completed group.
        key: String,
    },
}
