//! Union-find over node slots with per-group completion state.
//!
//! `petgraph` ships a plain union-find, but merged groups here carry a
//! payload (the aggregated pending count and member list), so the
//! structure is kept in-crate: parent/rank arrays indexed by node slot
//! plus a state map keyed by the current root.

use std::collections::HashMap;

/// Completion bookkeeping for one merged group.
#[derive(Debug, Clone)]
pub(crate) struct GroupState {
    /// Members that have not yet signalled completion.
    pub pending: usize,
    /// Whether the whole group transitioned to completed.
    pub completed: bool,
    /// Node slots belonging to this group.
    pub members: Vec<usize>,
}

/// Disjoint sets of node slots, each carrying a [`GroupState`].
#[derive(Debug, Default)]
pub(crate) struct UnionGroups {
    parent: Vec<usize>,
    rank: Vec<u8>,
    states: HashMap<usize, GroupState>,
}

impl UnionGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the next node slot as a singleton group with pending = 1.
    pub fn push_singleton(&mut self) -> usize {
        let slot = self.parent.len();
        self.parent.push(slot);
        self.rank.push(0);
        self.states.insert(
            slot,
            GroupState {
                pending: 1,
                completed: false,
                members: vec![slot],
            },
        );
        slot
    }

    /// Find the group root for a slot, halving paths on the way.
    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Union two groups, summing pending counts and concatenating members.
    ///
    /// Returns the surviving root. Callers must reject unions involving a
    /// completed group before calling.
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }
        let (winner, loser) = if self.rank[ra] >= self.rank[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        if self.rank[winner] == self.rank[loser] {
            self.rank[winner] += 1;
        }
        self.parent[loser] = winner;
        if let Some(lost) = self.states.remove(&loser)
            && let Some(state) = self.states.get_mut(&winner)
        {
            state.pending += lost.pending;
            state.members.extend(lost.members);
        }
        winner
    }

    /// Group state for the set containing `x`.
    pub fn state(&mut self, x: usize) -> &GroupState {
        let root = self.find(x);
        // A state entry exists for every root by construction.
        self.states.entry(root).or_insert_with(|| GroupState {
            pending: 0,
            completed: false,
            members: vec![root],
        })
    }

    /// Mutable group state for the set containing `x`.
    pub fn state_mut(&mut self, x: usize) -> &mut GroupState {
        let root = self.find(x);
        self.states.entry(root).or_insert_with(|| GroupState {
            pending: 0,
            completed: false,
            members: vec![root],
        })
    }

    /// Whether the group containing `x` has completed.
    pub fn is_completed(&mut self, x: usize) -> bool {
        self.state(x).completed
    }
}
