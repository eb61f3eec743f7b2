//! Cooperative process-wide cancellation
//!
//! The token is cloned into every long-running loop (scheduler take-loop,
//! LRU sweeps, remote retry loops). Cancellation is advisory: loops poll
//! [`CancelToken::check`] and unwind with [`Cancelled`], nothing is killed
//! preemptively.

use miette::Diagnostic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Raised when an operation observes the cancellation token
#[derive(Error, Debug, Diagnostic, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
#[diagnostic(code(kiln::core::cancelled))]
pub struct Cancelled;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; all clones observe it
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Return [`Cancelled`] if cancellation has been requested
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when the token has been cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
