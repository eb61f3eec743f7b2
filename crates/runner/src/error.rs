//! Error types for the work queue

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use kiln_core::Cancelled;
use miette::Diagnostic;
use thiserror::Error;

/// An opaque failure produced by a task action.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the work queue.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("task '{task}' failed")]
    #[diagnostic(
        code(kiln::runner::task_failed),
        help("inspect the task's own error output below")
    )]
    TaskFailed {
        task: String,
        #[source]
        source: TaskError,
    },

    #[error("task '{task}' requests {cost} which exceeds the queue capacity {cap}")]
    #[diagnostic(
        code(kiln::runner::cost_exceeds_cap),
        help("lower the task's resource cost or raise the queue capacity")
    )]
    CostExceedsCap {
        task: String,
        cost: String,
        cap: String,
    },

    #[error("worker thread panicked")]
    #[diagnostic(
        code(kiln::runner::worker_panicked),
        help("a task action panicked instead of returning an error; check the task implementations")
    )]
    WorkerPanicked,

    #[error("failed to spawn worker thread")]
    #[diagnostic(code(kiln::runner::spawn))]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(kiln::runner::cancelled))]
    Cancelled(#[from] Cancelled),
}

impl Error {
    pub fn task_failed(task: impl Into<String>, source: TaskError) -> Self {
        Self::TaskFailed {
            task: task.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
