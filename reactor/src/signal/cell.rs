/*
 *   Copyright (c) 2025 R3BL LLC
 *   All rights reserved.
 *
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! The unit of the signal graph: cells, subscription edges, and the edge
//! arena.
//!
//! Values are type-erased (`Rc<dyn Any>`) so one graph holds heterogeneous
//! cells; the typed handles in [`crate::signal::api`] are the only
//! constructors, so downcasts cannot fail for well-typed programs.
//!
//! Subscription edges live in a thread-local arena with a free-list. Each
//! edge is always a member of its reader's source list; it is additionally
//! linked into the source's subscriber list only while the reader is live
//! (a running rule, or a cell that itself has linked subscribers). That
//! conditional linking is what makes dependency maintenance demand-driven.

use std::{any::Any,
          cell::RefCell,
          rc::{Rc, Weak}};

use smallvec::SmallVec;

use crate::{ErrorPayload, Job, JobRef};

pub(crate) type AnyValue = Rc<dyn Any>;
pub(crate) type CellValue = Result<AnyValue, ErrorPayload>;
pub(crate) type ComputeFn = Box<dyn FnMut() -> miette::Result<AnyValue>>;
pub(crate) type CompareFn = Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>;

/// Index into the edge arena.
pub(crate) type SubIdx = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellKind {
    /// Mutable leaf.
    Value,
    /// Cached pure function of other cells.
    Computed,
    /// Side-effecting observer with its own job.
    Rule,
    /// Leaf fed by a stream source while demanded.
    StreamBacked,
}

/// Hooks a stream-backed cell uses to start/stop its source as demand comes
/// and goes. Both run from the demand-change queue, never synchronously at
/// the subscription-change site.
pub(crate) struct DemandHooks {
    pub start: Box<dyn Fn(&Rc<CellCore>)>,
    pub stop: Box<dyn Fn(&Rc<CellCore>)>,
}

pub(crate) struct CellCore {
    pub id: u64,
    pub inner: RefCell<CellInner>,
}

pub(crate) struct CellInner {
    pub kind: CellKind,
    /// `None` until first compute (computed cells only).
    pub value: Option<CellValue>,
    /// Timestamp of the last observable change. Never decreases.
    pub last_changed: u64,
    /// Equal to the current timestamp iff the cell was read or touched this
    /// timestamp.
    pub valid_through: u64,
    /// Max `last_changed` among transitive dirty ancestors (maintained by
    /// push for live cells).
    pub latest_source: u64,
    /// True while this cell's compute is on the stack.
    pub running: bool,
    pub compute: Option<ComputeFn>,
    pub compare: Option<CompareFn>,
    /// Edges where this cell is the reader.
    pub sources: SmallVec<[SubIdx; 4]>,
    /// Edges (linked) where this cell is the source.
    pub subscribers: SmallVec<[SubIdx; 4]>,
    /// Rules only: the queue this rule is dispatched on.
    pub queue: Option<crate::signal::RuleQueue>,
    /// Rules only: the job owning the current body execution.
    pub rule_job: Option<Job<()>>,
    /// The job rules/stream sources attach their work to.
    pub owner: Option<JobRef>,
    /// Rules only: the owner-job entry keeping this rule alive; disposed on
    /// stop so long-lived owners do not accumulate dead rules.
    pub owner_link: Option<crate::Disposer>,
    /// Rules only: permanently stopped.
    pub stopped: bool,
    pub demand: Option<DemandHooks>,
    /// Stream-backed only: the source is currently running.
    pub demand_active: bool,
}

impl CellCore {
    pub(crate) fn new(kind: CellKind) -> Rc<CellCore> {
        Rc::new(CellCore {
            id: crate::next_id(),
            inner: RefCell::new(CellInner {
                kind,
                value: None,
                last_changed: 0,
                valid_through: 0,
                latest_source: 0,
                running: false,
                compute: None,
                compare: None,
                sources: SmallVec::new(),
                subscribers: SmallVec::new(),
                queue: None,
                rule_job: None,
                owner: None,
                owner_link: None,
                stopped: false,
                demand: None,
                demand_active: false,
            }),
        })
    }

    pub(crate) fn kind(&self) -> CellKind { self.inner.borrow().kind }
}

impl std::fmt::Debug for CellCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("CellCore")
            .field("id", &self.id)
            .field("kind", &inner.kind)
            .field("last_changed", &inner.last_changed)
            .field("valid_through", &inner.valid_through)
            .field("sources", &inner.sources.len())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl Drop for CellCore {
    fn drop(&mut self) {
        // Free this cell's source edges from the arena. `try_with` because
        // drops can run during thread teardown after the arena is gone.
        let sources = std::mem::take(&mut self.inner.get_mut().sources);
        let id = self.id;
        if sources.is_empty() {
            return;
        }
        let _ = crate::signal::graph::try_release_edges_of(id, &sources);
    }
}

/// A dependency edge from a source cell to a reader (target) cell.
pub(crate) struct SubNode {
    pub src: Rc<CellCore>,
    pub src_id: u64,
    pub dst: Weak<CellCore>,
    pub dst_id: u64,
    /// The source's `last_changed` observed at the reader's last compute.
    pub ts: u64,
    /// Cleared before a recompute; set again when the read recurs.
    pub reused: bool,
    /// Currently a member of `src.subscribers`.
    pub linked: bool,
}

/// Slab-style arena with a free-list. Freed slots are `None` until reused.
#[derive(Default)]
pub(crate) struct SubArena {
    nodes: Vec<Option<SubNode>>,
    free: Vec<SubIdx>,
}

impl SubArena {
    pub(crate) fn alloc(&mut self, node: SubNode) -> SubIdx {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    pub(crate) fn free(&mut self, idx: SubIdx) -> Option<SubNode> {
        let taken = self.nodes.get_mut(idx).and_then(Option::take);
        if taken.is_some() {
            self.free.push(idx);
        }
        taken
    }

    pub(crate) fn get(&self, idx: SubIdx) -> Option<&SubNode> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, idx: SubIdx) -> Option<&mut SubNode> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    #[cfg(test)]
    pub(crate) fn live_len(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_node(src: &Rc<CellCore>, dst: &Rc<CellCore>) -> SubNode {
        SubNode {
            src: src.clone(),
            src_id: src.id,
            dst: Rc::downgrade(dst),
            dst_id: dst.id,
            ts: 0,
            reused: true,
            linked: false,
        }
    }

    #[test]
    fn test_arena_reuses_freed_slots() {
        let mut arena = SubArena::default();
        let a = CellCore::new(CellKind::Value);
        let b = CellCore::new(CellKind::Computed);

        let first = arena.alloc(dummy_node(&a, &b));
        let second = arena.alloc(dummy_node(&a, &b));
        assert_ne!(first, second);

        arena.free(first);
        assert!(arena.get(first).is_none());

        let third = arena.alloc(dummy_node(&a, &b));
        assert_eq!(third, first);
        assert_eq!(arena.live_len(), 2);
    }

    #[test]
    fn test_double_free_is_harmless() {
        let mut arena = SubArena::default();
        let a = CellCore::new(CellKind::Value);
        let b = CellCore::new(CellKind::Computed);

        let idx = arena.alloc(dummy_node(&a, &b));
        assert!(arena.free(idx).is_some());
        assert!(arena.free(idx).is_none());
        assert_eq!(arena.live_len(), 0);
    }
}
