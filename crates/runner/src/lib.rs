//! Resource-aware priority task execution for kiln.
//!
//! [`PriorityWorkQueue`] dispatches [`QueueTask`]s onto a fixed pool of
//! worker threads while keeping the sum of running [`ResourceVector`]
//! costs within a capacity. Scheduling picks the highest-priority task
//! whose cost currently fits, breaking ties by insertion order.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! use kiln_core::CancelToken;
//! use kiln_runner::{FnTask, PriorityWorkQueue, ResourceVector};
//!
//! let done = Arc::new(AtomicU32::new(0));
//! let queue = PriorityWorkQueue::new(
//!     2,
//!     ResourceVector::new().with("cpu", 2),
//!     CancelToken::new(),
//! )?;
//!
//! let counter = Arc::clone(&done);
//! queue.add(
//!     FnTask::new("greet", move || {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     })
//!     .with_cost(ResourceVector::new().with("cpu", 1)),
//! )?;
//!
//! queue.join()?;
//! assert_eq!(done.load(Ordering::SeqCst), 1);
//! # Ok::<(), kiln_runner::Error>(())
//! ```

pub mod error;
pub mod queue;
pub mod resource;
pub mod task;

pub use error::{Error, Result, TaskError};
pub use queue::PriorityWorkQueue;
pub use resource::ResourceVector;
pub use task::{FnTask, QueueTask};
