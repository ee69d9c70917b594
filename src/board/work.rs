use std::cmp::Ordering;

use crate::{net::ParticipantId, wire::Buffer};

pub type WorkId = u64;

/// The parent id of work submitted outside of any task.
pub const TOP_LEVEL: WorkId = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkState {
    /// Sitting in the ready structure.
    Queued,
    /// Handed to a participant, awaiting its result.
    Dispatched,
    /// Result posted, awaiting its claim.
    Completed,
}

/// The ids on the path from a top-level submission down to a work item,
/// the item itself last.
///
/// Lineages order the ready structure. Two lineages are walked in lock-step
/// from the top until they part; the items on either side of that fork are
/// siblings under the deepest common ancestor, and the older one (smaller
/// id) goes first. An ancestor goes before its own descendants. The effect
/// is first-come-first-served among siblings, with a subtask ranked by where
/// its ancestor stands rather than by its own, necessarily larger, id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lineage(Vec<WorkId>);

impl Lineage {
    pub fn root(id: WorkId) -> Self {
        Self(vec![id])
    }

    pub fn child(&self, id: WorkId) -> Self {
        let mut path = Vec::with_capacity(self.0.len() + 1);
        path.extend_from_slice(&self.0);
        path.push(id);
        Self(path)
    }

    pub fn id(&self) -> WorkId {
        self.0.last().copied().unwrap_or(TOP_LEVEL)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl Ord for Lineage {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            if a != b {
                return a.cmp(b);
            }
        }
        // one walk ran out first: it is the ancestor
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for Lineage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One submitted task, owned by the server from submission until its result
/// is claimed.
#[derive(Debug)]
pub struct WorkItem {
    pub id: WorkId,
    /// The item whose execution submitted this one. Fixed at creation.
    pub parent: Option<WorkId>,
    pub lineage: Lineage,
    /// Who submitted it.
    pub origin: ParticipantId,
    /// The packed call while queued or dispatched; the packed result once
    /// completed.
    pub payload: Buffer,
    pub state: WorkState,
}

impl WorkItem {
    /// The result table key this item is filed under.
    pub fn result_key(&self) -> WorkId {
        self.parent.unwrap_or(TOP_LEVEL)
    }
}
