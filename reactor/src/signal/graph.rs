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

//! The signal graph engine: timestamp discipline, dependency tracking, dirty
//! propagation, recalculation, and the demand-driven subscription lifecycle.
//!
//! Timestamp rules:
//! - The global timestamp advances when a write outside any sweep changes a
//!   value and at least one cell was read since the last advance.
//! - Rule-phase writes (inside a sweep) never advance it; every write in one
//!   flush shares a timestamp, which is what makes a flush a consistent
//!   snapshot.
//! - A cell's `valid_through` equals the current timestamp iff the cell was
//!   read or touched this timestamp; the virtual-read list records cells
//!   validated clean without recomputation, so writes to them still conflict.
//!
//! Borrow discipline: no thread-local borrow (graph state or any cell's
//! inner) is held across a call into user code, and `with_graph` is never
//! nested.

use std::{cell::RefCell,
          rc::{Rc, Weak}};

use smallvec::SmallVec;

use super::{cell::{AnyValue, CellCore, CellKind, SubArena, SubIdx, SubNode},
            errors::SignalError};
use crate::{defer,
            job::context::{current_cell, push_frame, report_unhandled, Frame},
            BatchQueue, ErrorPayload};

pub(crate) struct GraphState {
    pub now: u64,
    pub read_since_advance: bool,
    pub virtual_reads: Vec<Weak<CellCore>>,
    pub arena: SubArena,
    pub in_sweep: bool,
    pub current_queue: Option<u64>,
}

impl Default for GraphState {
    fn default() -> Self {
        Self {
            now: 1,
            read_since_advance: false,
            virtual_reads: Vec::new(),
            arena: SubArena::default(),
            in_sweep: false,
            current_queue: None,
        }
    }
}

thread_local! {
    static GRAPH: RefCell<GraphState> = RefCell::new(GraphState::default());
    static DEMAND_QUEUE: RefCell<Option<BatchQueue<Rc<CellCore>>>> =
        const { RefCell::new(None) };
}

pub(crate) fn with_graph<R>(f: impl FnOnce(&mut GraphState) -> R) -> R {
    GRAPH.with(|graph| f(&mut graph.borrow_mut()))
}

pub(crate) fn now() -> u64 { with_graph(|graph| graph.now) }

pub(crate) fn set_sweep(active: bool) -> bool {
    with_graph(|graph| std::mem::replace(&mut graph.in_sweep, active))
}

pub(crate) fn set_current_queue(id: Option<u64>) {
    with_graph(|graph| graph.current_queue = id);
}

/// Read a cell's value, creating/reusing a dependency edge when called from
/// inside another cell's computation.
///
/// # Errors
///
/// Fails with [`SignalError::CircularDependency`] when the cell is currently
/// computing, or re-throws the error the cell's last compute produced.
pub(crate) fn read_cell(cell: &Rc<CellCore>) -> miette::Result<AnyValue> {
    catch_up(cell)?;

    if let Some(reader) = current_cell() {
        if !Rc::ptr_eq(&reader, cell) {
            track_dependency(&reader, cell);
        }
    }
    with_graph(|graph| graph.read_since_advance = true);

    let value = cell.inner.borrow().value.clone();
    match value {
        Some(Ok(value)) => Ok(value),
        Some(Err(payload)) => Err(payload.to_report()),
        None => Err(miette::miette!("cell has no value after catch-up")),
    }
}

/// Read without dependency tracking. Write-conflict detection remains in
/// effect (the read still validates the cell at the current timestamp).
pub(crate) fn peek_cell(cell: &Rc<CellCore>) -> miette::Result<AnyValue> {
    let _guard = push_frame(Frame::default());
    read_cell(cell)
}

/// Ensure the cell is valid at the current timestamp, recomputing if any
/// source changed past this cell's `valid_through`.
pub(crate) fn catch_up(cell: &Rc<CellCore>) -> miette::Result<()> {
    let now = now();
    {
        let inner = cell.inner.borrow();
        if inner.running {
            return Err(miette::Report::new(SignalError::CircularDependency));
        }
        if inner.valid_through == now {
            return Ok(());
        }
    }

    let has_compute = cell.inner.borrow().compute.is_some();
    if !has_compute {
        // Leaf (or degraded constant): touching it validates it.
        cell.inner.borrow_mut().valid_through = now;
        return Ok(());
    }

    if needs_recalc(cell)? {
        recalc(cell)
    } else {
        // Transitively clean: a virtual read. A write to this cell in the
        // same timestamp must conflict exactly as if it had been read.
        cell.inner.borrow_mut().valid_through = now;
        with_graph(|graph| graph.virtual_reads.push(Rc::downgrade(cell)));
        Ok(())
    }
}

fn needs_recalc(cell: &Rc<CellCore>) -> miette::Result<bool> {
    {
        let inner = cell.inner.borrow();
        if inner.value.is_none() {
            return Ok(true);
        }
        // Live cells receive pushes, so `latest_source` is authoritative.
        let live = match inner.kind {
            CellKind::Rule => !inner.stopped,
            _ => !inner.subscribers.is_empty(),
        };
        if live && inner.latest_source <= inner.valid_through {
            return Ok(false);
        }
    }

    let source_idxs: SmallVec<[SubIdx; 4]> = cell.inner.borrow().sources.clone();
    for idx in source_idxs {
        let maybe_edge = with_graph(|graph| {
            graph.arena.get(idx).and_then(|node| {
                (node.dst_id == cell.id).then(|| (node.src.clone(), node.ts))
            })
        });
        let Some((src, ts)) = maybe_edge else { continue };
        catch_up(&src)?;
        if src.inner.borrow().last_changed > ts {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Recompute a cell: mark edges stale-for-reuse, run the compute inside a
/// cell frame, prune edges not re-read, store the result (an `Err` becomes
/// the cell's value for computed cells; it stops the rule for rule cells).
pub(crate) fn recalc(cell: &Rc<CellCore>) -> miette::Result<()> {
    let kind = cell.kind();

    let prior_edges: SmallVec<[SubIdx; 4]> = cell.inner.borrow().sources.clone();
    with_graph(|graph| {
        for idx in &prior_edges {
            if let Some(node) = graph.arena.get_mut(*idx) {
                if node.dst_id == cell.id {
                    node.reused = false;
                }
            }
        }
    });

    // Rules own a job per body execution: end the previous one (running the
    // body's cleanups) before the new run.
    let frame_job = match kind {
        CellKind::Rule => Some(cycle_rule_job(cell)?),
        _ => None,
    };

    let mut compute = {
        let mut inner = cell.inner.borrow_mut();
        inner.running = true;
        inner.compute.take()
    };
    let result = match compute.as_mut() {
        Some(compute_fn) => {
            let _guard = push_frame(Frame {
                job: frame_job,
                cell: Some(cell.clone()),
                inlet: None,
            });
            compute_fn()
        }
        None => Ok(Rc::new(()) as AnyValue),
    };
    {
        let mut inner = cell.inner.borrow_mut();
        inner.running = false;
        if inner.compute.is_none() {
            inner.compute = compute;
        }
    }

    prune_stale_edges(cell, &prior_edges);

    if cell.inner.borrow().stopped {
        // The body stopped the rule reentrantly; nothing left to store.
        return Ok(());
    }

    match result {
        Ok(new_value) => store_value(cell, new_value),
        Err(report) => match kind {
            CellKind::Rule => {
                let payload = ErrorPayload::new(report);
                let owner = cell.inner.borrow().owner.clone();
                stop_rule(cell);
                tracing::warn!("rule stopped: its body returned an error");
                match owner {
                    Some(owner) => owner.async_throw_payload(payload),
                    None => report_unhandled(&payload),
                }
            }
            _ => store_error(cell, ErrorPayload::new(report)),
        },
    }

    // A computed cell left with no sources degrades to a constant.
    if kind == CellKind::Computed {
        let mut inner = cell.inner.borrow_mut();
        if inner.sources.is_empty() {
            inner.compute = None;
        }
    }
    Ok(())
}

fn store_value(cell: &Rc<CellCore>, new_value: AnyValue) {
    let now = now();
    let (old_value, compare) = {
        let inner = cell.inner.borrow();
        (inner.value.clone(), inner.compare.clone())
    };
    let changed = match (&old_value, &compare) {
        (Some(Ok(old)), Some(compare)) => !compare(old.as_ref(), new_value.as_ref()),
        // First compute, or recovery after an error: always distinct.
        _ => true,
    };
    let mut inner = cell.inner.borrow_mut();
    inner.value = Some(Ok(new_value));
    inner.valid_through = now;
    if changed {
        inner.last_changed = now;
    }
}

fn store_error(cell: &Rc<CellCore>, payload: ErrorPayload) {
    let now = now();
    let mut inner = cell.inner.borrow_mut();
    inner.value = Some(Err(payload));
    inner.valid_through = now;
    inner.last_changed = now;
}

fn cycle_rule_job(cell: &Rc<CellCore>) -> miette::Result<crate::JobRef> {
    let (old_job, owner) = {
        let mut inner = cell.inner.borrow_mut();
        (inner.rule_job.take(), inner.owner.clone())
    };
    if let Some(job) = old_job {
        job.end();
    }
    let owner = owner.ok_or_else(|| miette::miette!("rule cell has no owner job"))?;
    let body = owner.start_empty::<()>();
    cell.inner.borrow_mut().rule_job = Some(body.clone());
    Ok(body.to_ref())
}

fn prune_stale_edges(cell: &Rc<CellCore>, prior: &[SubIdx]) {
    for idx in prior {
        let stale = with_graph(|graph| {
            graph
                .arena
                .get(*idx)
                .is_some_and(|node| node.dst_id == cell.id && !node.reused)
        });
        if stale {
            remove_edge(cell, *idx);
        }
    }
}

fn remove_edge(dst: &Rc<CellCore>, idx: SubIdx) {
    {
        let mut inner = dst.inner.borrow_mut();
        if let Some(position) = inner.sources.iter().position(|i| *i == idx) {
            inner.sources.remove(position);
        }
    }
    let freed = with_graph(|graph| graph.arena.free(idx));
    if let Some(node) = freed {
        if node.linked {
            remove_subscriber_entry(&node.src, idx);
        }
    }
}

fn track_dependency(reader: &Rc<CellCore>, source: &Rc<CellCore>) {
    let src_last_changed = source.inner.borrow().last_changed;

    let sources_snapshot: SmallVec<[SubIdx; 4]> = reader.inner.borrow().sources.clone();
    let mut found: Option<SubIdx> = None;
    with_graph(|graph| {
        for idx in &sources_snapshot {
            if let Some(node) = graph.arena.get_mut(*idx) {
                if node.dst_id == reader.id && node.src_id == source.id {
                    node.reused = true;
                    node.ts = src_last_changed;
                    found = Some(*idx);
                    break;
                }
            }
        }
    });

    match found {
        Some(idx) => {
            // Most-recently-read edges move to the head of the source list.
            let mut inner = reader.inner.borrow_mut();
            if let Some(position) = inner.sources.iter().position(|i| *i == idx) {
                inner.sources.remove(position);
                inner.sources.insert(0, idx);
            }
        }
        None => {
            let idx = with_graph(|graph| {
                graph.arena.alloc(SubNode {
                    src: source.clone(),
                    src_id: source.id,
                    dst: Rc::downgrade(reader),
                    dst_id: reader.id,
                    ts: src_last_changed,
                    reused: true,
                    linked: false,
                })
            });
            reader.inner.borrow_mut().sources.insert(0, idx);
            if is_live(reader) {
                link_edge(idx);
            }
        }
    }
}

fn is_live(cell: &Rc<CellCore>) -> bool {
    let inner = cell.inner.borrow();
    match inner.kind {
        CellKind::Rule => !inner.stopped,
        _ => !inner.subscribers.is_empty(),
    }
}

/// Link an edge into its source's subscriber list. Gaining the first
/// subscriber cascades: a computed source subscribes to its own sources, a
/// stream-backed source gets a demand re-evaluation.
pub(crate) fn link_edge(idx: SubIdx) {
    let maybe_src = with_graph(|graph| {
        graph.arena.get_mut(idx).and_then(|node| {
            if node.linked {
                None
            } else {
                node.linked = true;
                Some(node.src.clone())
            }
        })
    });
    let Some(src) = maybe_src else { return };

    let first = {
        let mut inner = src.inner.borrow_mut();
        let was_empty = inner.subscribers.is_empty();
        inner.subscribers.push(idx);
        was_empty
    };
    if first {
        on_first_subscriber(&src);
    }
}

/// Unlink an edge from its source's subscriber list, cascading on the last
/// subscriber.
pub(crate) fn unlink_edge(idx: SubIdx) {
    let maybe_src = with_graph(|graph| {
        graph.arena.get_mut(idx).and_then(|node| {
            if node.linked {
                node.linked = false;
                Some(node.src.clone())
            } else {
                None
            }
        })
    });
    if let Some(src) = maybe_src {
        remove_subscriber_entry(&src, idx);
    }
}

fn remove_subscriber_entry(src: &Rc<CellCore>, idx: SubIdx) {
    let became_empty = {
        let mut inner = src.inner.borrow_mut();
        if let Some(position) = inner.subscribers.iter().position(|i| *i == idx) {
            inner.subscribers.remove(position);
        }
        inner.subscribers.is_empty()
    };
    if became_empty {
        on_last_subscriber(src);
    }
}

fn on_first_subscriber(src: &Rc<CellCore>) {
    match src.kind() {
        CellKind::Computed => {
            let idxs: SmallVec<[SubIdx; 4]> = src.inner.borrow().sources.clone();
            for idx in idxs {
                link_edge(idx);
            }
        }
        CellKind::StreamBacked => demand_changed(src),
        _ => {}
    }
}

fn on_last_subscriber(src: &Rc<CellCore>) {
    match src.kind() {
        CellKind::Computed => {
            let idxs: SmallVec<[SubIdx; 4]> = src.inner.borrow().sources.clone();
            for idx in idxs {
                unlink_edge(idx);
            }
        }
        CellKind::StreamBacked => demand_changed(src),
        _ => {}
    }
}

/// Write a value into a cell, enforcing the write rules for the current
/// context, then propagate dirtiness through the linked subscriber graph.
pub(crate) fn write_cell(cell: &Rc<CellCore>, new_value: AnyValue) -> miette::Result<()> {
    let ctx = current_cell();
    if let Some(reader) = &ctx {
        if reader.kind() == CellKind::Computed {
            return Err(miette::Report::new(SignalError::SideEffectForbidden));
        }
    }

    let (now, sweeping) = with_graph(|graph| (graph.now, graph.in_sweep));

    if sweeping {
        // Rule-phase write: shares the flush timestamp.
        if cell.inner.borrow().valid_through == now {
            return Err(miette::Report::new(SignalError::WriteConflict));
        }
        if let Some(rule) = &ctx {
            if rule.kind() == CellKind::Rule && is_direct_source_of(rule, cell) {
                return Err(miette::Report::new(SignalError::CircularDependency));
            }
        }
        apply_write(cell, new_value, now);
        return Ok(());
    }

    // Outside any sweep.
    let (old_value, compare) = {
        let inner = cell.inner.borrow();
        (inner.value.clone(), inner.compare.clone())
    };
    let unchanged = match (&old_value, &compare) {
        (Some(Ok(old)), Some(compare)) => compare(old.as_ref(), new_value.as_ref()),
        _ => false,
    };
    let virtual_outstanding = with_graph(|graph| {
        graph.virtual_reads.retain(|weak| weak.upgrade().is_some());
        !graph.virtual_reads.is_empty()
    });
    if unchanged && !virtual_outstanding {
        return Ok(());
    }

    let ts = with_graph(|graph| {
        if graph.read_since_advance {
            graph.now += 1;
            graph.read_since_advance = false;
            graph.virtual_reads.clear();
        }
        graph.now
    });
    apply_write(cell, new_value, ts);
    Ok(())
}

fn apply_write(cell: &Rc<CellCore>, new_value: AnyValue, ts: u64) {
    {
        let mut inner = cell.inner.borrow_mut();
        inner.value = Some(Ok(new_value));
        inner.last_changed = ts;
        inner.valid_through = ts;
    }
    propagate_dirty(cell, ts);
}

fn is_direct_source_of(rule: &Rc<CellCore>, cell: &Rc<CellCore>) -> bool {
    let source_idxs: SmallVec<[SubIdx; 4]> = rule.inner.borrow().sources.clone();
    with_graph(|graph| {
        source_idxs.iter().any(|idx| {
            graph
                .arena
                .get(*idx)
                .is_some_and(|node| node.dst_id == rule.id && node.src_id == cell.id)
        })
    })
}

/// Walk the linked subscriber graph with an explicit stack, bumping
/// `latest_source` and enqueueing affected rules.
fn propagate_dirty(origin: &Rc<CellCore>, ts: u64) {
    let mut stack: Vec<Rc<CellCore>> = vec![origin.clone()];
    while let Some(cell) = stack.pop() {
        let sub_idxs: SmallVec<[SubIdx; 4]> = cell.inner.borrow().subscribers.clone();
        for idx in sub_idxs {
            let maybe_dst = with_graph(|graph| {
                graph
                    .arena
                    .get(idx)
                    .and_then(|node| (node.src_id == cell.id).then(|| node.dst.upgrade()))
                    .flatten()
            });
            let Some(dst) = maybe_dst else { continue };

            let (kind, stopped, has_subs, queue) = {
                let mut inner = dst.inner.borrow_mut();
                if inner.latest_source < ts {
                    inner.latest_source = ts;
                }
                (
                    inner.kind,
                    inner.stopped,
                    !inner.subscribers.is_empty(),
                    inner.queue.clone(),
                )
            };
            if kind == CellKind::Rule && !stopped {
                if let Some(queue) = queue {
                    queue.add_cell(&dst);
                }
            }
            if has_subs {
                stack.push(dst);
            }
        }
    }
}

/// Permanently stop a rule: end its body job, leave its queue, release its
/// edges, and detach it from its owner.
pub(crate) fn stop_rule(cell: &Rc<CellCore>) {
    let (job, queue, owner_link) = {
        let mut inner = cell.inner.borrow_mut();
        if inner.stopped {
            return;
        }
        inner.stopped = true;
        inner.compute = None;
        (
            inner.rule_job.take(),
            inner.queue.clone(),
            inner.owner_link.take(),
        )
    };
    if let Some(queue) = queue {
        queue.remove_cell(cell);
    }
    if let Some(link) = owner_link {
        link.dispose();
    }
    if let Some(job) = job {
        job.end();
    }
    release_source_edges(cell);
}

/// Unlink and free every source edge of `cell`.
pub(crate) fn release_source_edges(cell: &Rc<CellCore>) {
    let idxs: SmallVec<[SubIdx; 4]> =
        std::mem::take(&mut cell.inner.borrow_mut().sources);
    for idx in idxs {
        let freed = with_graph(|graph| {
            let valid = graph
                .arena
                .get(idx)
                .is_some_and(|node| node.dst_id == cell.id);
            if valid { graph.arena.free(idx) } else { None }
        });
        if let Some(node) = freed {
            if node.linked {
                remove_subscriber_entry(&node.src, idx);
            }
        }
    }
}

/// Free edges of a dying cell. Called from `Drop`, so the thread-local may
/// already be gone during thread teardown.
pub(crate) fn try_release_edges_of(
    dst_id: u64,
    idxs: &[SubIdx],
) -> Result<(), std::thread::AccessError> {
    let freed: Vec<(SubIdx, SubNode)> = GRAPH.try_with(|graph| {
        let mut graph = graph.borrow_mut();
        let mut out = Vec::new();
        for idx in idxs {
            let valid = graph
                .arena
                .get(*idx)
                .is_some_and(|node| node.dst_id == dst_id);
            if valid {
                if let Some(node) = graph.arena.free(*idx) {
                    out.push((*idx, node));
                }
            }
        }
        out
    })?;
    for (idx, node) in freed {
        if node.linked {
            remove_subscriber_entry(&node.src, idx);
        }
    }
    Ok(())
}

/// Run a rule from its queue: catch up (which recomputes only if a source
/// really changed). Rules whose owner job ended are stopped instead.
pub(crate) fn run_rule_now(cell: &Rc<CellCore>) {
    let (stopped, owner) = {
        let inner = cell.inner.borrow();
        (inner.stopped, inner.owner.clone())
    };
    if stopped {
        return;
    }
    let owner_gone = owner.as_ref().is_none_or(crate::JobRef::is_ended);
    if owner_gone {
        stop_rule(cell);
        return;
    }
    if let Err(report) = catch_up(cell) {
        let payload = ErrorPayload::new(report);
        stop_rule(cell);
        match owner {
            Some(owner) => owner.async_throw_payload(payload),
            None => report_unhandled(&payload),
        }
    }
}

/// True if the cell currently has linked subscribers (it is observed).
pub(crate) fn is_observed_cell(cell: &Rc<CellCore>) -> bool {
    !cell.inner.borrow().subscribers.is_empty()
}

/// Queue a demand re-evaluation for a stream-backed cell.
pub(crate) fn demand_changed(cell: &Rc<CellCore>) {
    demand_queue().add(cell.clone());
}

fn demand_queue() -> BatchQueue<Rc<CellCore>> {
    DEMAND_QUEUE.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.get_or_insert_with(|| {
            BatchQueue::new(
                |a, b| Rc::ptr_eq(a, b),
                |queue| {
                    let queue = queue.clone();
                    defer(move || queue.flush());
                },
                |queue| {
                    while let Some(cell) = queue.pop() {
                        evaluate_demand(&cell);
                    }
                },
            )
        })
        .clone()
    })
}

/// Start or stop a stream-backed cell's source based on current demand.
fn evaluate_demand(cell: &Rc<CellCore>) {
    let (demanded, active, hooks) = {
        let mut inner = cell.inner.borrow_mut();
        let demanded = !inner.subscribers.is_empty();
        let active = inner.demand_active;
        if demanded == active {
            return;
        }
        inner.demand_active = demanded;
        (demanded, active, inner.demand.take())
    };
    let Some(hooks) = hooks else { return };
    if demanded && !active {
        (hooks.start)(cell);
    } else {
        (hooks.stop)(cell);
    }
    // Put the hooks back unless the cell installed new ones meanwhile.
    let mut inner = cell.inner.borrow_mut();
    if inner.demand.is_none() {
        inner.demand = Some(hooks);
    }
}
