//! Error types for the build driver

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Errors surfaced while wiring or reporting on a build session.
///
/// Task-action failures do not land here: they are collected by the work
/// queue and surfaced in the [`crate::BuildReport`].
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Topology(#[from] kiln_topo::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] kiln_runner::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] kiln_core::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] kiln_store::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Remote(#[from] kiln_remote::RemoteError),

    #[error("serialization failed: {message}")]
    #[diagnostic(code(kiln::driver::serialization))]
    Serialization { message: String },
}

impl Error {
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
