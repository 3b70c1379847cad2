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

//! The public signal API: [`value`], [`cached`], [`rule`], [`peek`],
//! [`action`], [`run_rules`], [`unchanged_if`], and friends.
//!
//! Reads and writes are fallible: reading a cell that cached an error
//! re-throws it, and writes enforce the sweep rules ([`crate::SignalError`]).
//! Cell types are `Clone + PartialEq`; equality is what suppresses downstream
//! invalidation when a recompute produces a structurally equal result.

use std::{any::Any, cell::Cell, marker::PhantomData, rc::Rc};

use super::{cell::{AnyValue, CellCore, CellKind, CompareFn},
            graph,
            rule_queue::{default_queue, RuleQueue}};
use crate::job::context::{current_cell, owner_job, pop_error_capture,
                          push_error_capture, push_frame, Frame};

/// A mutable leaf cell. Cloning yields another handle to the same cell.
pub struct Value<T> {
    cell: Rc<CellCore>,
    _phantom: PhantomData<T>,
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value").field("cell", &self.cell).finish()
    }
}

impl<T: Clone + PartialEq + 'static> Value<T> {
    /// Read the current value, recording a dependency when called from
    /// inside a computation.
    ///
    /// # Errors
    ///
    /// Fails on circular dependency.
    pub fn get(&self) -> miette::Result<T> {
        graph::read_cell(&self.cell).and_then(downcast::<T>)
    }

    /// Read without dependency tracking.
    ///
    /// # Errors
    ///
    /// Fails on circular dependency.
    pub fn peek(&self) -> miette::Result<T> {
        graph::peek_cell(&self.cell).and_then(downcast::<T>)
    }

    /// Write a new value. Writing an equal value from outside any sweep is a
    /// no-op (no rule is queued).
    ///
    /// # Errors
    ///
    /// Fails with [`crate::SignalError::WriteConflict`] when the cell was
    /// already read in the current sweep, and with
    /// [`crate::SignalError::SideEffectForbidden`] from inside a computed
    /// cell.
    pub fn set(&self, new_value: T) -> miette::Result<()> {
        graph::write_cell(&self.cell, Rc::new(new_value))
    }

    /// True if some live subscriber (rule or demanded computed chain)
    /// observes this cell.
    #[must_use]
    pub fn is_observed(&self) -> bool { graph::is_observed_cell(&self.cell) }

    pub(crate) fn cell(&self) -> &Rc<CellCore> { &self.cell }
}

/// Create a mutable leaf cell.
pub fn value<T: Clone + PartialEq + 'static>(initial: T) -> Value<T> {
    let cell = CellCore::new(CellKind::Value);
    {
        let mut inner = cell.inner.borrow_mut();
        inner.value = Some(Ok(Rc::new(initial) as AnyValue));
        inner.last_changed = graph::now();
        inner.compare = Some(make_compare::<T>());
    }
    Value {
        cell,
        _phantom: PhantomData,
    }
}

/// A cached computed cell: a pure function of other cells, recomputed only
/// when a source actually changed past its validity.
pub struct Cached<T> {
    cell: Rc<CellCore>,
    _phantom: PhantomData<T>,
}

impl<T> Clone for Cached<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Cached<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cached").field("cell", &self.cell).finish()
    }
}

impl<T: Clone + 'static> Cached<T> {
    /// Read the cached value, recomputing if stale.
    ///
    /// # Errors
    ///
    /// Re-throws the error cached by a failed compute (until a source change
    /// causes recomputation), and fails on circular dependency.
    pub fn get(&self) -> miette::Result<T> {
        graph::read_cell(&self.cell).and_then(downcast::<T>)
    }

    /// Read without dependency tracking.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Cached::get`].
    pub fn peek(&self) -> miette::Result<T> {
        graph::peek_cell(&self.cell).and_then(downcast::<T>)
    }

    #[must_use]
    pub fn is_observed(&self) -> bool { graph::is_observed_cell(&self.cell) }

    pub(crate) fn cell(&self) -> &Rc<CellCore> { &self.cell }

    pub(crate) fn from_cell(cell: Rc<CellCore>) -> Self {
        Self {
            cell,
            _phantom: PhantomData,
        }
    }
}

/// Create a computed cell from a fallible compute function. The compute may
/// read other cells (creating dependencies); it must not write.
pub fn cached<T, F>(mut compute: F) -> Cached<T>
where
    T: Clone + PartialEq + 'static,
    F: FnMut() -> miette::Result<T> + 'static,
{
    let cell = CellCore::new(CellKind::Computed);
    {
        let mut inner = cell.inner.borrow_mut();
        inner.compute = Some(Box::new(move || {
            compute().map(|value| Rc::new(value) as AnyValue)
        }));
        inner.compare = Some(make_compare::<T>());
    }
    Cached {
        cell,
        _phantom: PhantomData,
    }
}

/// Handle to a rule: a side-effecting observer scheduled on a rule queue and
/// owned by the job that created it.
#[derive(Clone)]
pub struct RuleHandle {
    cell: Rc<CellCore>,
}

impl std::fmt::Debug for RuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleHandle")
            .field("cell", &self.cell)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl RuleHandle {
    /// Permanently stop the rule: its body job ends (running its cleanups),
    /// it leaves its queue, and its subscriptions are released.
    pub fn stop(&self) { graph::stop_rule(&self.cell); }

    #[must_use]
    pub fn is_stopped(&self) -> bool { self.cell.inner.borrow().stopped }
}

fn make_rule(queue: &RuleQueue, mut body: Box<dyn FnMut() -> miette::Result<()>>) -> RuleHandle {
    let owner = owner_job();
    let cell = CellCore::new(CellKind::Rule);
    {
        let mut inner = cell.inner.borrow_mut();
        inner.compute = Some(Box::new(move || {
            body()?;
            Ok(Rc::new(()) as AnyValue)
        }));
        inner.owner = Some(owner.clone());
        inner.queue = Some(queue.clone());
    }

    // The owner job keeps the rule alive and stops it when the owner ends.
    let keep = cell.clone();
    let link = owner.release(move || {
        graph::stop_rule(&keep);
        Ok(())
    });
    cell.inner.borrow_mut().owner_link = Some(link);

    // Every rule runs at least once, on the next flush of its queue.
    queue.add_cell(&cell);

    RuleHandle { cell }
}

/// Create a rule on the default queue, attached to the current job (or the
/// root at top level). Returns a handle whose `stop()` ends it.
pub fn rule(body: impl FnMut() -> miette::Result<()> + 'static) -> RuleHandle {
    make_rule(&default_queue(), Box::new(body))
}

/// Create a rule on a specific queue (see [`crate::rule_queue()`]).
pub fn rule_in(
    queue: &RuleQueue,
    body: impl FnMut() -> miette::Result<()> + 'static,
) -> RuleHandle {
    make_rule(queue, Box::new(body))
}

/// Like [`rule`], but the body receives the rule's own handle so it can stop
/// itself.
pub fn rule_with_stop(
    mut body: impl FnMut(&RuleHandle) -> miette::Result<()> + 'static,
) -> RuleHandle {
    let slot: Rc<std::cell::RefCell<Option<RuleHandle>>> =
        Rc::new(std::cell::RefCell::new(None));
    let slot_clone = slot.clone();
    let handle = rule(move || {
        let maybe_self = slot_clone.borrow().clone();
        match maybe_self {
            Some(own_handle) => body(&own_handle),
            None => Ok(()),
        }
    });
    *slot.borrow_mut() = Some(handle.clone());
    handle
}

/// Run `f` outside dependency tracking: reads inside it create no edges.
/// Write-conflict detection remains in effect.
pub fn peek<R>(f: impl FnOnce() -> R) -> R {
    let _guard = push_frame(Frame::default());
    f()
}

/// Run `f` outside any cell context, so writes are allowed even from inside
/// a rule body's helper code. Sweep write rules still apply.
pub fn action<R>(f: impl FnOnce() -> R) -> R {
    let _guard = push_frame(Frame::default());
    f()
}

/// Drain the default rule queue synchronously.
///
/// # Errors
///
/// Returns the first rule error that reached the root unhandled during the
/// drain (eg: a write conflict raised inside a rule body).
pub fn run_rules() -> miette::Result<()> {
    push_error_capture();
    default_queue().flush();
    let captured = pop_error_capture();
    match captured.into_iter().next() {
        Some(payload) => Err(payload.into_report()),
        None => Ok(()),
    }
}

/// Inside a recompute: return the previous value when it equals `new_value`,
/// so downstream cells see no change. With the `PartialEq` cell bound this
/// is the default behavior already; this form exists for symmetry with
/// [`unchanged_if_cmp`].
pub fn unchanged_if<T: Clone + PartialEq + 'static>(new_value: T) -> T {
    unchanged_if_cmp(new_value, |a: &T, b: &T| a == b)
}

/// Inside a recompute: return the previous value when `cmp(prev, new)` holds,
/// suppressing downstream invalidation for results the comparator considers
/// equal. After an error recalc the new value is always treated as distinct.
pub fn unchanged_if_cmp<T: Clone + 'static>(
    new_value: T,
    cmp: impl Fn(&T, &T) -> bool,
) -> T {
    let Some(cell) = current_cell() else {
        return new_value;
    };
    let prev = cell.inner.borrow().value.clone();
    if let Some(Ok(prev_value)) = prev {
        if let Some(prev_typed) = prev_value.downcast_ref::<T>() {
            if cmp(prev_typed, &new_value) {
                return prev_typed.clone();
            }
        }
    }
    new_value
}

/// Inside a compute: true if the computing cell currently has subscribers.
/// Outside any cell context: false.
#[must_use]
pub fn is_observed() -> bool {
    current_cell().is_some_and(|cell| graph::is_observed_cell(&cell))
}

/// An external invalidation source a compute can subscribe to. Triggering it
/// dirties every subscribed compute without carrying a value.
#[derive(Clone, Debug)]
pub struct RecalcTrigger {
    counter: Value<u64>,
    next: Rc<Cell<u64>>,
}

impl Default for RecalcTrigger {
    fn default() -> Self { Self::new() }
}

impl RecalcTrigger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: value(0u64),
            next: Rc::new(Cell::new(0)),
        }
    }

    /// Call from inside a compute to make it recalc when [`Self::trigger`]
    /// fires.
    ///
    /// # Errors
    ///
    /// Fails on circular dependency.
    pub fn subscribe(&self) -> miette::Result<()> { self.counter.get().map(|_value| ()) }

    /// Invalidate all subscribed computes.
    ///
    /// # Errors
    ///
    /// Subject to the usual write rules (eg: write conflict inside a sweep
    /// that already observed this trigger).
    pub fn trigger(&self) -> miette::Result<()> {
        let bumped = self.next.get() + 1;
        self.next.set(bumped);
        self.counter.set(bumped)
    }
}

pub(crate) fn make_compare<T: PartialEq + 'static>() -> CompareFn {
    Rc::new(|a: &dyn Any, b: &dyn Any| {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    })
}

fn downcast<T: Clone + 'static>(any_value: AnyValue) -> miette::Result<T> {
    any_value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| miette::miette!("cell value has an unexpected type"))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::{current_job, new_root, SignalError};

    fn log_cell<T>() -> Rc<std::cell::RefCell<Vec<T>>> {
        Rc::new(std::cell::RefCell::new(vec![]))
    }

    #[test]
    fn test_rule_runs_once_on_first_flush() {
        let _root = new_root();
        let v = value(0);
        let log = log_cell();

        let v_rule = v.clone();
        let log_rule = log.clone();
        rule(move || {
            log_rule.borrow_mut().push(v_rule.get()?);
            Ok(())
        });

        assert!(log.borrow().is_empty());
        run_rules().unwrap();
        assert_eq!(*log.borrow(), vec![0]);
    }

    #[test]
    fn test_equal_write_queues_no_rule() {
        let _root = new_root();
        let v = value(0);
        let log = log_cell();

        let v_rule = v.clone();
        let log_rule = log.clone();
        rule(move || {
            log_rule.borrow_mut().push(v_rule.get()?);
            Ok(())
        });
        run_rules().unwrap();

        v.set(0).unwrap();
        run_rules().unwrap();
        assert_eq!(*log.borrow(), vec![0]);
    }

    #[test]
    fn test_coalesced_writes_rerun_once_with_final_value() {
        let _root = new_root();
        let v = value(0);
        let log = log_cell();

        let v_rule = v.clone();
        let log_rule = log.clone();
        rule(move || {
            log_rule.borrow_mut().push(v_rule.get()?);
            Ok(())
        });
        run_rules().unwrap();

        v.set(1).unwrap();
        v.set(2).unwrap();
        run_rules().unwrap();
        assert_eq!(*log.borrow(), vec![0, 2]);
    }

    #[test]
    fn test_short_circuit_consistency() {
        let _root = new_root();
        let v1 = value(42);
        let v2 = value(57);
        let s = value("x");
        let log = log_cell();

        let (v1_c, v2_c) = (v1.clone(), v2.clone());
        let c = cached(move || Ok(v1_c.get()? != 0 && v2_c.get()? != 0));

        let (c_rule, s_rule) = (c.clone(), s.clone());
        let log_rule = log.clone();
        rule(move || {
            if c_rule.get()? {
                log_rule.borrow_mut().push(s_rule.get()?);
            }
            Ok(())
        });
        run_rules().unwrap();
        assert_eq!(*log.borrow(), vec!["x"]);

        // c recomputes to an equal value: the rule must not rerun.
        v2.set(99).unwrap();
        run_rules().unwrap();
        assert_eq!(*log.borrow(), vec!["x"]);

        // A rule-phase write to s reruns the logging rule in the same flush.
        let s_writer = s.clone();
        let fired = Rc::new(std::cell::Cell::new(false));
        let fired_clone = fired.clone();
        rule(move || {
            if !fired_clone.replace(true) {
                s_writer.set("y")?;
            }
            Ok(())
        });
        run_rules().unwrap();
        assert_eq!(*log.borrow(), vec!["x", "y"]);
    }

    #[test]
    fn test_write_conflict_after_peek_in_same_sweep() {
        let _root = new_root();
        let v = value(99);

        let v_rule = v.clone();
        rule(move || {
            let current = v_rule.peek()?;
            v_rule.set(current + 1)?;
            Ok(())
        });

        let error = run_rules().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<SignalError>(),
            Some(SignalError::WriteConflict)
        ));
        // The faulting rule stopped itself; the graph stays usable.
        assert_eq!(v.get().unwrap(), 99);
        run_rules().unwrap();
    }

    #[test]
    fn test_computed_cell_may_not_write() {
        let _root = new_root();
        let v = value(1);
        let target = value(0);

        let (v_c, target_c) = (v.clone(), target.clone());
        let c = cached(move || {
            target_c.set(v_c.get()?)?;
            Ok(0)
        });

        // The compute's error is cached in the cell, so the caller sees a
        // forwarded report; match on the message.
        let error = c.get().unwrap_err();
        assert!(format!("{error}").contains("computed cells may not write"));
    }

    #[test]
    fn test_cached_error_is_rethrown_until_source_changes() {
        let _root = new_root();
        let v = value(0);

        let v_c = v.clone();
        let c = cached(move || {
            let current = v_c.get()?;
            if current == 0 {
                Err(miette::miette!("zero is not allowed"))
            } else {
                Ok(current * 10)
            }
        });

        assert!(c.get().is_err());
        // Same timestamp: the cached error is re-thrown, not recomputed.
        assert!(c.get().is_err());

        v.set(3).unwrap();
        assert_eq!(c.get().unwrap(), 30);
    }

    #[test]
    fn test_circular_dependency_is_detected() {
        let _root = new_root();
        let slot: Rc<RefCell<Option<Cached<i32>>>> = Rc::new(RefCell::new(None));

        let slot_c = slot.clone();
        let c = cached(move || {
            let maybe_self = slot_c.borrow().clone();
            match maybe_self {
                Some(own_cell) => Ok(own_cell.get()? + 1),
                None => Ok(0),
            }
        });
        *slot.borrow_mut() = Some(c.clone());

        let error = c.get().unwrap_err();
        assert!(format!("{error}").contains("circular dependency"));
    }

    #[test]
    fn test_peek_does_not_create_dependency() {
        let _root = new_root();
        let v = value(0);
        let log = log_cell();

        let v_rule = v.clone();
        let log_rule = log.clone();
        rule(move || {
            log_rule.borrow_mut().push(v_rule.peek()?);
            Ok(())
        });
        run_rules().unwrap();
        assert_eq!(log.borrow().len(), 1);

        v.set(5).unwrap();
        run_rules().unwrap();
        // Peeked-only source: the rule does not rerun.
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_unchanged_if_cmp_suppresses_downstream() {
        let _root = new_root();
        let v = value(1);
        let log = log_cell();

        // Parity comparator: results with the same parity count as unchanged.
        let v_c = v.clone();
        let c = cached(move || {
            let next = v_c.get()?;
            Ok(unchanged_if_cmp(next, |prev, new| prev % 2 == new % 2))
        });

        let c_rule = c.clone();
        let log_rule = log.clone();
        rule(move || {
            log_rule.borrow_mut().push(c_rule.get()?);
            Ok(())
        });
        run_rules().unwrap();
        assert_eq!(*log.borrow(), vec![1]);

        v.set(3).unwrap();
        run_rules().unwrap();
        // 3 has the same parity as 1: downstream sees no change.
        assert_eq!(*log.borrow(), vec![1]);

        v.set(4).unwrap();
        run_rules().unwrap();
        assert_eq!(*log.borrow(), vec![1, 4]);
    }

    #[test]
    fn test_stopped_rule_never_reruns_and_runs_cleanups() {
        let _root = new_root();
        let v = value(0);
        let log = log_cell();

        let v_rule = v.clone();
        let log_rule = log.clone();
        let handle = rule(move || {
            let run_number = v_rule.get()?;
            log_rule.borrow_mut().push(format!("run {run_number}"));
            let log_cleanup = log_rule.clone();
            current_job()?.must(move || {
                log_cleanup.borrow_mut().push("cleanup".to_string());
                Ok(())
            });
            Ok(())
        });
        run_rules().unwrap();
        assert_eq!(*log.borrow(), vec!["run 0"]);

        // Rerunning ends the previous body job first (cleanup before body).
        v.set(1).unwrap();
        run_rules().unwrap();
        assert_eq!(*log.borrow(), vec!["run 0", "cleanup", "run 1"]);

        handle.stop();
        assert!(handle.is_stopped());
        assert_eq!(
            *log.borrow(),
            vec!["run 0", "cleanup", "run 1", "cleanup"]
        );

        v.set(2).unwrap();
        run_rules().unwrap();
        assert_eq!(log.borrow().len(), 4);
    }

    #[test]
    fn test_is_observed_tracks_live_subscribers() {
        let _root = new_root();
        let v = value(0);
        assert!(!v.is_observed());

        let v_rule = v.clone();
        let handle = rule(move || v_rule.get().map(|_observed| ()));
        run_rules().unwrap();
        assert!(v.is_observed());

        handle.stop();
        assert!(!v.is_observed());
    }

    #[test]
    fn test_recalc_trigger_invalidates_subscribers() {
        let _root = new_root();
        let trigger = RecalcTrigger::new();
        let runs = Rc::new(std::cell::Cell::new(0));

        let trigger_c = trigger.clone();
        let runs_c = runs.clone();
        let c = cached(move || {
            trigger_c.subscribe()?;
            runs_c.set(runs_c.get() + 1);
            Ok(())
        });

        c.get().unwrap();
        c.get().unwrap();
        assert_eq!(runs.get(), 1);

        trigger.trigger().unwrap();
        c.get().unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test_case(0; "zero")]
    #[test_case(-7; "negative")]
    #[test_case(i64::MAX; "max")]
    fn test_value_round_trips(initial: i64) {
        let _root = new_root();
        let v = value(initial);
        assert_eq!(v.get().unwrap(), initial);
        assert_eq!(v.peek().unwrap(), initial);
    }

    #[test]
    fn test_action_allows_writes_from_helper_code() {
        let _root = new_root();
        let v = value(0);
        let result = action(|| v.set(10));
        result.unwrap();
        assert_eq!(v.get().unwrap(), 10);
    }
}
