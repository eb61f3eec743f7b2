use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kiln_core::{CancelToken, Cancelled};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::resource::ResourceVector;
use crate::task::QueueTask;

/// How long an idle worker sleeps before re-checking the cancel token.
const IDLE_POLL: Duration = Duration::from_millis(50);

struct PrioEntry {
    priority: i64,
    seq: u64,
    task: Box<dyn QueueTask>,
}

impl PartialEq for PrioEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PrioEntry {}

impl PartialOrd for PrioEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioEntry {
    // Max-heap key: higher priority wins, and among equal priorities the
    // lower sequence number (the earlier add) wins.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    /// One max-heap per distinct cost vector.
    buckets: HashMap<ResourceVector, BinaryHeap<PrioEntry>>,
    /// Sum of the costs of all currently running tasks.
    usage: ResourceVector,
    queued: usize,
    running: usize,
    next_seq: u64,
    stop: bool,
    first_error: Option<Error>,
}

struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
    cap: ResourceVector,
    cancel: CancelToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A priority work queue over a fixed pool of worker threads.
///
/// Each task carries a [`ResourceVector`] cost; the queue keeps the sum of
/// running costs within the capacity it was built with. Among the tasks
/// whose cost currently fits, the highest priority dispatches first, with
/// insertion order breaking ties.
///
/// Tasks may [`add`](Self::add) further tasks while they run, including
/// during the final drain: [`join`](Self::join) only returns once the
/// queue is empty and every worker has exited.
pub struct PriorityWorkQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityWorkQueue {
    /// Spawns `workers` threads (at least one) sharing `cap`.
    ///
    /// The token is polled between tasks; cancelling it makes workers
    /// abandon everything still queued and exit once running tasks finish.
    pub fn new(workers: usize, cap: ResourceVector, cancel: CancelToken) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            cap,
            cancel,
        });

        let count = workers.max(1);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("kiln-worker-{i}"))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    shared.lock().stop = true;
                    shared.ready.notify_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(Error::Spawn { source });
                }
            }
        }

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    /// Enqueues a task, reading its cost and priority once.
    ///
    /// A cost that can never fit the queue capacity is rejected here
    /// rather than left to wedge the workers.
    pub fn add(&self, task: impl QueueTask + 'static) -> Result<()> {
        let cost = task.cost();
        let priority = task.priority();
        if !cost.fits_within(&self.shared.cap) {
            return Err(Error::CostExceedsCap {
                task: task.name().to_string(),
                cost: cost.to_string(),
                cap: self.shared.cap.to_string(),
            });
        }

        let mut state = self.shared.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queued += 1;
        state.buckets.entry(cost).or_default().push(PrioEntry {
            priority,
            seq,
            task: Box::new(task),
        });
        drop(state);

        self.shared.ready.notify_one();
        Ok(())
    }

    /// Number of tasks waiting for dispatch.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.lock().queued
    }

    /// Number of tasks currently executing.
    #[must_use]
    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    #[must_use]
    pub fn capacity(&self) -> &ResourceVector {
        &self.shared.cap
    }

    /// Drains the queue and waits for every worker to exit.
    ///
    /// Returns the first task failure (or the cancellation) observed, in
    /// dispatch order; later failures are logged by the workers but not
    /// reported here. Tasks added after `join` returns are never run.
    pub fn join(&self) -> Result<()> {
        self.shared.lock().stop = true;
        self.shared.ready.notify_all();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.drain(..).collect()
        };
        let mut panicked = false;
        for handle in handles {
            if handle.join().is_err() {
                panicked = true;
            }
        }

        let mut state = self.shared.lock();
        if panicked && state.first_error.is_none() {
            state.first_error = Some(Error::WorkerPanicked);
        }
        match state.first_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Picks the dispatchable entry with the best (priority, insertion) key.
///
/// A bucket is dispatchable when current usage plus its cost still fits
/// the capacity. Emptied buckets are dropped so the scan stays bounded by
/// the number of distinct costs in flight.
fn select_best(state: &mut QueueState, cap: &ResourceVector) -> Option<(ResourceVector, PrioEntry)> {
    let mut best: Option<(ResourceVector, i64, u64)> = None;
    for (cost, heap) in &state.buckets {
        let Some(top) = heap.peek() else { continue };
        let mut projected = state.usage.clone();
        projected.add_assign(cost);
        if !projected.fits_within(cap) {
            continue;
        }
        let better = match &best {
            None => true,
            Some((_, best_priority, best_seq)) => {
                (top.priority, Reverse(top.seq)) > (*best_priority, Reverse(*best_seq))
            }
        };
        if better {
            best = Some((cost.clone(), top.priority, top.seq));
        }
    }

    let (cost, _, _) = best?;
    let heap = state.buckets.get_mut(&cost)?;
    let entry = heap.pop()?;
    if heap.is_empty() {
        state.buckets.remove(&cost);
    }
    Some((cost, entry))
}

fn worker_loop(shared: &Shared) {
    let mut state = shared.lock();
    loop {
        if shared.cancel.is_cancelled() {
            if state.first_error.is_none() {
                state.first_error = Some(Error::Cancelled(Cancelled));
            }
            // Abandon whatever is still queued; running tasks on other
            // workers finish on their own.
            state.buckets.clear();
            state.queued = 0;
            drop(state);
            shared.ready.notify_all();
            return;
        }

        if let Some((cost, entry)) = select_best(&mut state, &shared.cap) {
            state.usage.add_assign(&cost);
            state.queued -= 1;
            state.running += 1;
            drop(state);

            debug!(task = entry.task.name(), cost = %cost, "dispatching task");
            let outcome = entry.task.run();

            state = shared.lock();
            state.usage.sub_assign(&cost);
            state.running -= 1;
            if let Err(source) = outcome {
                warn!(task = entry.task.name(), error = %source, "task failed");
                if state.first_error.is_none() {
                    state.first_error = Some(Error::task_failed(entry.task.name(), source));
                }
            }
            drop(state);

            // Capacity was released; blocked siblings may fit now.
            shared.ready.notify_all();
            state = shared.lock();
            continue;
        }

        if state.stop && state.queued == 0 && state.running == 0 {
            return;
        }

        let (guard, _) = shared
            .ready
            .wait_timeout(state, IDLE_POLL)
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
    }
}
