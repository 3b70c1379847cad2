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

//! Rule queues: batch queues of rule cells.
//!
//! While one rule queue drains, no other may: a reentrant drain attempt
//! leaves its items queued and relies on the batch queue's rescheduling.
//! Each outermost drain opens a fresh sweep epoch (advancing the timestamp
//! if any cell was read since the last advance), so write-conflict detection
//! is scoped to reads within the current sweep.

use std::{cell::RefCell, rc::Rc};

use super::{cell::CellCore,
            graph::{run_rule_now, set_current_queue, set_sweep, with_graph}};
use crate::{defer, next_id, BatchQueue};

type DispatchFn = Rc<dyn Fn(Box<dyn FnOnce()>)>;

/// A queue of rule cells with an injected dispatch function deciding when
/// flushes run. The default queue dispatches via [`crate::defer`]. Cloning
/// yields another handle to the same queue.
#[derive(Clone)]
pub struct RuleQueue {
    id: u64,
    batch: BatchQueue<Rc<CellCore>>,
}

impl std::fmt::Debug for RuleQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleQueue")
            .field("id", &self.id)
            .field("empty", &self.batch.is_empty())
            .finish()
    }
}

impl RuleQueue {
    fn with_dispatch(dispatch: DispatchFn) -> Self {
        let id = next_id();
        let batch = BatchQueue::new(
            |a: &Rc<CellCore>, b: &Rc<CellCore>| Rc::ptr_eq(a, b),
            move |queue| {
                let queue = queue.clone();
                dispatch(Box::new(move || queue.flush()));
            },
            move |queue| reap_rules(id, queue),
        );
        Self { id, batch }
    }

    /// Drain synchronously (subject to the exclusive-drain rule).
    pub fn flush(&self) { self.batch.flush(); }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.batch.is_empty() }

    pub(crate) fn add_cell(&self, cell: &Rc<CellCore>) { self.batch.add(cell.clone()); }

    pub(crate) fn remove_cell(&self, cell: &Rc<CellCore>) { self.batch.delete(cell); }
}

fn reap_rules(id: u64, queue: &BatchQueue<Rc<CellCore>>) {
    // Exclusive drain: another queue is mid-drain, so leave the items queued;
    // the batch queue reschedules on exit.
    let blocked = with_graph(|graph| {
        graph.current_queue.is_some_and(|current| current != id)
    });
    if blocked {
        return;
    }

    set_current_queue(Some(id));
    let prev_sweep = set_sweep(true);
    if !prev_sweep {
        open_sweep_epoch();
    }

    while let Some(cell) = queue.pop() {
        run_rule_now(&cell);
    }

    set_sweep(prev_sweep);
    set_current_queue(None);
}

/// Start a fresh sweep epoch: if any cell was read since the last timestamp
/// advance, advance it now so conflict detection is scoped to this sweep.
fn open_sweep_epoch() {
    with_graph(|graph| {
        if graph.read_since_advance {
            graph.now += 1;
            graph.read_since_advance = false;
            graph.virtual_reads.clear();
        }
    });
}

/// Build a rule queue dispatched by `dispatch`, which receives a flush thunk
/// whenever the queue transitions from empty-and-unscheduled.
pub fn rule_queue(dispatch: impl Fn(Box<dyn FnOnce()>) + 'static) -> RuleQueue {
    RuleQueue::with_dispatch(Rc::new(dispatch))
}

thread_local! {
    static DEFAULT_QUEUE: RefCell<Option<RuleQueue>> = const { RefCell::new(None) };
}

/// The queue rules land on unless created with [`crate::rule_in`]. Flushes
/// are dispatched on the microtask queue; [`crate::run_rules`] drains it
/// synchronously.
pub(crate) fn default_queue() -> RuleQueue {
    DEFAULT_QUEUE.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.get_or_insert_with(|| RuleQueue::with_dispatch(Rc::new(|flush| defer(flush))))
            .clone()
    })
}
