//! Dependency-ordered completion tracking over a task graph.
//!
//! A [`Topology`] owns one node per task key. Nodes move through
//! `added -> scheduled -> semi-completed -> completed`:
//!
//! - [`Topology::add_node`] registers a node with no dependencies.
//! - [`Topology::add_deps`] wires dependency edges; only legal before the
//!   dependant is scheduled.
//! - [`Topology::schedule_node`] attaches the ready callback, which fires
//!   once every dependency group has completed (immediately if they
//!   already have).
//! - [`Topology::notify_dependants`] signals that one node's work is done;
//!   when the last member of its merged group signals, the whole group
//!   completes atomically and dependants are decremented.
//!
//! Ready callbacks are always invoked after the internal lock is
//! released, so callback code may freely re-enter the topology; the
//! decision that a callback is due is made while holding the lock.

use crate::error::{Error, Result};
use crate::group::UnionGroups;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

type ReadyCallback<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// One completed merged group, in completion order, with the keys of the
/// groups it waited on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEntry {
    /// Member keys, in the order they were merged.
    pub members: Vec<String>,
    /// Keys of dependency nodes outside the group, deduplicated and sorted.
    pub deps: Vec<String>,
}

struct NodeRecord<T> {
    key: String,
    payload: T,
    scheduled: bool,
    notified: bool,
    pending_deps: usize,
    callback: Option<ReadyCallback<T>>,
}

struct Inner<T> {
    /// Edges run from a dependency to its dependant: completion flows
    /// along edge direction.
    graph: DiGraph<NodeRecord<T>, ()>,
    index: HashMap<String, NodeIndex>,
    groups: UnionGroups,
    log: Vec<ReplayEntry>,
}

/// Dependency completion tracker with merged (union-find) groups.
pub struct Topology<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Topology<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Topology<T> {
    /// Create an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                graph: DiGraph::new(),
                index: HashMap::new(),
                groups: UnionGroups::new(),
                log: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.lock().graph.node_count()
    }

    /// Whether a key has been registered.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().index.contains_key(key)
    }

    /// Keys that were never scheduled, sorted.
    #[must_use]
    pub fn get_unscheduled(&self) -> Vec<String> {
        let inner = self.lock();
        let mut keys: Vec<String> = inner
            .graph
            .node_indices()
            .filter(|&i| !inner.graph[i].scheduled)
            .map(|i| inner.graph[i].key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Keys whose merged group never completed, sorted.
    ///
    /// A non-empty result after a drain means some producer failed or
    /// never signalled; this is the primary stuck-build diagnostic.
    #[must_use]
    pub fn get_uncompleted(&self) -> Vec<String> {
        let mut inner = self.lock();
        let indices: Vec<NodeIndex> = inner.graph.node_indices().collect();
        let mut keys = Vec::new();
        for i in indices {
            if !inner.groups.is_completed(i.index()) {
                keys.push(inner.graph[i].key.clone());
            }
        }
        keys.sort_unstable();
        keys
    }

    /// Snapshot of the completion log, in completion order.
    #[must_use]
    pub fn replay(&self) -> Vec<ReplayEntry> {
        self.lock().log.clone()
    }
}

impl<T: Clone> Topology<T> {
    /// Register a task under `key`.
    ///
    /// The node starts unscheduled, in a singleton group, with no pending
    /// dependencies.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateNode`] if the key is already present.
    pub fn add_node(&self, key: impl Into<String>, payload: T) -> Result<()> {
        let key = key.into();
        let mut inner = self.lock();
        if inner.index.contains_key(&key) {
            return Err(Error::DuplicateNode { key });
        }
        let idx = inner.graph.add_node(NodeRecord {
            key: key.clone(),
            payload,
            scheduled: false,
            notified: false,
            pending_deps: 0,
            callback: None,
        });
        let slot = inner.groups.push_singleton();
        debug_assert_eq!(slot, idx.index());
        inner.index.insert(key, idx);
        Ok(())
    }

    /// Declare that `from` depends on each of `deps`.
    ///
    /// Dependencies whose group already completed are skipped: they
    /// contribute nothing to the pending count. Self-references are
    /// ignored. Adding the same dependency twice counts twice and is
    /// resolved edge-by-edge at completion.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyScheduled`] if `from` was scheduled,
    /// [`Error::UnknownNode`] / [`Error::MissingDependencies`] for keys
    /// never added.
    pub fn add_deps(&self, from: &str, deps: &[&str]) -> Result<()> {
        let mut inner = self.lock();
        let from_idx = *inner
            .index
            .get(from)
            .ok_or_else(|| Error::UnknownNode { key: from.into() })?;
        if inner.graph[from_idx].scheduled {
            return Err(Error::AlreadyScheduled { key: from.into() });
        }

        let missing: Vec<String> = deps
            .iter()
            .filter(|d| !inner.index.contains_key(**d))
            .map(|d| (*d).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingDependencies { keys: missing });
        }

        for dep in deps {
            let dep_idx = inner.index[*dep];
            if dep_idx == from_idx {
                debug!(node = %from, "ignoring self-dependency");
                continue;
            }
            if inner.groups.is_completed(dep_idx.index()) {
                continue;
            }
            inner.graph.add_edge(dep_idx, from_idx, ());
            inner.graph[from_idx].pending_deps += 1;
        }
        Ok(())
    }

    /// Union the groups of `a` and `b`, summing their pending counts.
    ///
    /// Existing dependency edges between members of the resulting group
    /// keep gating readiness; use [`Topology::condense_cycles`] to merge
    /// strongly connected components with their internal edges
    /// neutralized.
    ///
    /// # Errors
    ///
    /// [`Error::GroupCompleted`] if either group already completed,
    /// [`Error::UnknownNode`] for keys never added.
    pub fn merge_nodes(&self, a: &str, b: &str) -> Result<()> {
        let mut inner = self.lock();
        let a_idx = *inner
            .index
            .get(a)
            .ok_or_else(|| Error::UnknownNode { key: a.into() })?;
        let b_idx = *inner
            .index
            .get(b)
            .ok_or_else(|| Error::UnknownNode { key: b.into() })?;
        if inner.groups.is_completed(a_idx.index()) {
            return Err(Error::GroupCompleted { key: a.into() });
        }
        if inner.groups.is_completed(b_idx.index()) {
            return Err(Error::GroupCompleted { key: b.into() });
        }
        inner.groups.union(a_idx.index(), b_idx.index());
        debug!(a = %a, b = %b, "groups merged");
        Ok(())
    }

    /// Merge every strongly connected component into one group.
    ///
    /// Dependency edges internal to a component stop counting toward
    /// readiness, so mutually dependent nodes can still be dispatched.
    /// Returns the number of multi-node components condensed.
    ///
    /// # Errors
    ///
    /// [`Error::GroupCompleted`] if a component touches a completed group.
    pub fn condense_cycles(&self) -> Result<usize> {
        let mut inner = self.lock();
        let sccs = petgraph::algo::tarjan_scc(&inner.graph);
        let mut condensed = 0;
        for scc in sccs {
            if scc.len() < 2 {
                continue;
            }
            for &idx in &scc {
                if inner.groups.is_completed(idx.index()) {
                    return Err(Error::GroupCompleted {
                        key: inner.graph[idx].key.clone(),
                    });
                }
            }
            let first = scc[0].index();
            for &idx in &scc[1..] {
                inner.groups.union(first, idx.index());
            }
            // Internal edges no longer gate readiness.
            for &idx in &scc {
                let incoming: Vec<NodeIndex> = inner
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .collect();
                let root = inner.groups.find(idx.index());
                let internal_edges = incoming
                    .iter()
                    .filter(|d| inner.groups.find(d.index()) == root)
                    .count();
                let rec = &mut inner.graph[idx];
                rec.pending_deps = rec.pending_deps.saturating_sub(internal_edges);
            }
            condensed += 1;
        }
        if condensed > 0 {
            debug!(groups = condensed, "condensed dependency cycles");
        }
        Ok(condensed)
    }

    /// Mark `key` schedulable and attach its ready callback.
    ///
    /// If every dependency has already completed, the callback is invoked
    /// inline before returning, outside the internal lock. Otherwise it
    /// fires later from whichever `notify_dependants` call completes the
    /// last pending dependency group.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyScheduled`] on repeated scheduling,
    /// [`Error::UnknownNode`] for keys never added.
    pub fn schedule_node<F>(&self, key: &str, ready: F) -> Result<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        let payload = {
            let mut inner = self.lock();
            let idx = *inner
                .index
                .get(key)
                .ok_or_else(|| Error::UnknownNode { key: key.into() })?;
            let rec = &mut inner.graph[idx];
            if rec.scheduled {
                return Err(Error::AlreadyScheduled { key: key.into() });
            }
            rec.scheduled = true;
            if rec.pending_deps > 0 {
                rec.callback = Some(Box::new(ready));
                debug!(node = %key, pending = rec.pending_deps, "scheduled, waiting on deps");
                return Ok(());
            }
            rec.payload.clone()
        };
        debug!(node = %key, "scheduled and immediately ready");
        ready(payload);
        Ok(())
    }

    /// Signal that the work for `key` is done.
    ///
    /// Decrements the merged group's pending count. When it reaches zero
    /// the whole group completes in one atomic step: a replay entry is
    /// recorded, every dependant of every member sees its pending count
    /// drop, and dependants that become ready while scheduled have their
    /// callbacks fired after the lock is released.
    ///
    /// This must be called exactly once per node, even for skipped work;
    /// a node that never signals leaves its dependants waiting forever.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyNotified`] on a second call for the same key,
    /// [`Error::UnknownNode`] for keys never added.
    pub fn notify_dependants(&self, key: &str) -> Result<()> {
        let ready = {
            let mut inner = self.lock();
            let idx = *inner
                .index
                .get(key)
                .ok_or_else(|| Error::UnknownNode { key: key.into() })?;
            if inner.graph[idx].notified {
                return Err(Error::AlreadyNotified { key: key.into() });
            }
            inner.graph[idx].notified = true;

            let root = inner.groups.find(idx.index());
            let state = inner.groups.state_mut(root);
            state.pending -= 1;
            let remaining = state.pending;
            debug!(node = %key, remaining, "completion signalled");
            if remaining > 0 {
                return Ok(());
            }

            state.completed = true;
            let members = state.members.clone();
            Self::complete_group(&mut inner, root, &members)
        };
        for (cb, payload) in ready {
            cb(payload);
        }
        Ok(())
    }

    /// Group completion under the lock: record replay, decrement
    /// dependants, collect due callbacks.
    fn complete_group(
        inner: &mut Inner<T>,
        root: usize,
        members: &[usize],
    ) -> Vec<(ReadyCallback<T>, T)> {
        let mut member_keys = Vec::with_capacity(members.len());
        let mut dep_keys = BTreeSet::new();
        for &m in members {
            let m_idx = NodeIndex::new(m);
            member_keys.push(inner.graph[m_idx].key.clone());
            let incoming: Vec<NodeIndex> = inner
                .graph
                .neighbors_directed(m_idx, Direction::Incoming)
                .collect();
            for d in incoming {
                if inner.groups.find(d.index()) != root {
                    dep_keys.insert(inner.graph[d].key.clone());
                }
            }
        }
        inner.log.push(ReplayEntry {
            members: member_keys.clone(),
            deps: dep_keys.into_iter().collect(),
        });
        debug!(members = ?member_keys, "group completed");

        let mut ready = Vec::new();
        for &m in members {
            let m_idx = NodeIndex::new(m);
            let dependants: Vec<NodeIndex> = inner
                .graph
                .neighbors_directed(m_idx, Direction::Outgoing)
                .collect();
            for d_idx in dependants {
                if inner.groups.find(d_idx.index()) == root {
                    // Edges inside the completing group were either
                    // neutralized at condensation or are the caller's
                    // responsibility; they carry no pending count here.
                    continue;
                }
                let rec = &mut inner.graph[d_idx];
                rec.pending_deps -= 1;
                if rec.pending_deps == 0
                    && rec.scheduled
                    && let Some(cb) = rec.callback.take()
                {
                    ready.push((cb, rec.payload.clone()));
                }
            }
        }
        ready
    }
}
