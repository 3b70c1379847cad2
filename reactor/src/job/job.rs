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

//! Cancellable jobs with hierarchical lifetime.
//!
//! A [`Job`] settles exactly once with an [`Outcome`] (value, error, or
//! cancel), after which its result is immutable and its cleanups have run.
//! Ending a parent tears down the whole subtree in three phases: child jobs
//! (descendants run to completion first, no matter when they were started
//! relative to the parent's own cleanups), then the release chain, then the
//! must chain in reverse registration order.
//!
//! The typed handle [`Job<T>`] carries the result type; the erased handle
//! [`JobRef`] is what flows through the ambient context stack and the
//! parent/child topology.

use std::{cell::{Cell, RefCell},
          future::Future,
          rc::{Rc, Weak},
          task::Waker};

use super::{cleanup::{CleanupFn, DoneFn, ReleaseEntry},
            context::{owner_job, push_frame, report_unhandled, Frame},
            driver::DriverState,
            errors::JobError};
use crate::{defer, next_id, unregister_steppable, ErrorPayload, Outcome};

pub(crate) type AsyncCatchFn = Box<dyn Fn(ErrorPayload) -> miette::Result<()>>;

/// Object-safe view of a job, used for the ambient stack and parent edges.
pub(crate) trait ErasedJob {
    fn id(&self) -> u64;
    fn end_erased(&self);
    fn is_ended_erased(&self) -> bool;
    fn async_throw_erased(&self, payload: ErrorPayload);
    fn must_erased(&self, cb: CleanupFn);
    fn release_erased(&self, cb: CleanupFn) -> super::cleanup::Disposer;
    fn attach_child_erased(&self, child: JobRef) -> super::cleanup::Disposer;
    fn parent_erased(&self) -> Option<JobRef>;
}

/// A parent's record of a started child: ended during the child phase of the
/// parent's teardown unless the child ended first and disposed the entry.
pub(crate) struct ChildEntry {
    job: JobRef,
    disposed: Rc<Cell<bool>>,
}

/// A type-erased handle to a job. Cloning is cheap (reference counted).
#[derive(Clone)]
pub struct JobRef {
    pub(crate) inner: Rc<dyn ErasedJob>,
}

impl std::fmt::Debug for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRef")
            .field("id", &self.inner.id())
            .field("ended", &self.inner.is_ended_erased())
            .finish()
    }
}

impl JobRef {
    #[must_use]
    pub fn id(&self) -> u64 { self.inner.id() }

    /// Cancel the job (idempotent after settlement).
    pub fn end(&self) { self.inner.end_erased(); }

    #[must_use]
    pub fn is_ended(&self) -> bool { self.inner.is_ended_erased() }

    #[must_use]
    pub fn ptr_eq(&self, other: &JobRef) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register an unconditional cleanup.
    pub fn must(&self, cb: impl FnOnce() -> miette::Result<()> + 'static) {
        self.inner.must_erased(Box::new(cb));
    }

    /// Register a cancellable cleanup; the returned [`Disposer`] withdraws it.
    pub fn release(
        &self,
        cb: impl FnOnce() -> miette::Result<()> + 'static,
    ) -> super::cleanup::Disposer {
        self.inner.release_erased(Box::new(cb))
    }

    /// Route an error along the async path: `async_catch` handler if
    /// installed, else the job's own failure, escalating to the parent chain.
    pub fn async_throw(&self, error: miette::Report) {
        self.inner.async_throw_erased(ErrorPayload::new(error));
    }

    pub(crate) fn async_throw_payload(&self, payload: ErrorPayload) {
        self.inner.async_throw_erased(payload);
    }

    pub(crate) fn attach_child(&self, child: JobRef) -> super::cleanup::Disposer {
        self.inner.attach_child_erased(child)
    }

    pub(crate) fn parent(&self) -> Option<JobRef> { self.inner.parent_erased() }

    /// Start a child job driving `fut`. The first driver step runs on the
    /// next microtask.
    pub fn start<T, F>(&self, fut: F) -> Job<T>
    where
        T: 'static,
        F: Future<Output = miette::Result<T>> + 'static,
    {
        let job = Job::<T>::new_attached(self);
        job.install_driver(fut);
        job
    }

    /// Start an empty child job: it stays open until settled explicitly (or
    /// its parent ends). The anchor for conduits and externally-settled work.
    pub fn start_empty<T: 'static>(&self) -> Job<T> { Job::<T>::new_attached(self) }

    /// Start a child job whose only content is a cleanup callback.
    pub fn start_cleanup(
        &self,
        cb: impl FnOnce() -> miette::Result<()> + 'static,
    ) -> Job<()> {
        let job = self.start_empty::<()>();
        job.must(cb);
        job
    }
}

/// A cancellable unit of work with lifetime, cleanup chains, and a single
/// result of type `T`. Cloning yields another handle to the same job.
pub struct Job<T: 'static> {
    pub(crate) core: Rc<JobCore<T>>,
}

impl<T: 'static> Clone for Job<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: 'static> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.core.id)
            .field("ended", &self.core.result.borrow().is_some())
            .finish()
    }
}

pub(crate) struct JobCore<T: 'static> {
    pub(crate) id: u64,
    pub(crate) result: RefCell<Option<Rc<Outcome<T>>>>,
    /// Must chain (incl. `on_done` observers); run last, newest first.
    pub(crate) musts: RefCell<Vec<DoneFn<T>>>,
    /// Release chain; run after children, newest first, disposable.
    pub(crate) releases: RefCell<Vec<ReleaseEntry>>,
    /// Started children; ended first on teardown, newest first.
    pub(crate) children: RefCell<Vec<ChildEntry>>,
    pub(crate) parent: RefCell<Option<Weak<dyn ErasedJob>>>,
    pub(crate) async_catch: RefCell<Option<AsyncCatchFn>>,
    pub(crate) driver: RefCell<Option<DriverState<T>>>,
    /// True while the driver is polling the job's future on this stack.
    pub(crate) running: Cell<bool>,
    /// A settle that arrived while the driver was on the stack; applied after
    /// the poll returns.
    pub(crate) pending_settle: RefCell<Option<Outcome<T>>>,
    pub(crate) waiters: RefCell<Vec<Waker>>,
    /// Self pointer so object-safe methods can recover an owning handle.
    weak_self: Weak<JobCore<T>>,
    is_root: bool,
}

impl<T: 'static> Job<T> {
    fn new_core(is_root: bool) -> Rc<JobCore<T>> {
        Rc::new_cyclic(|weak_self| JobCore {
            id: next_id(),
            result: RefCell::new(None),
            musts: RefCell::new(Vec::new()),
            releases: RefCell::new(Vec::new()),
            children: RefCell::new(Vec::new()),
            parent: RefCell::new(None),
            async_catch: RefCell::new(None),
            driver: RefCell::new(None),
            running: Cell::new(false),
            pending_settle: RefCell::new(None),
            waiters: RefCell::new(Vec::new()),
            weak_self: weak_self.clone(),
            is_root,
        })
    }

    pub(crate) fn new_attached(parent: &JobRef) -> Self {
        let job = Self {
            core: Self::new_core(false),
        };
        job.attach_to(parent);
        job
    }

    pub(crate) fn attach_to(&self, parent: &JobRef) {
        *self.core.parent.borrow_mut() = Some(Rc::downgrade(&parent.inner));
        // The parent ends us during the child phase of its teardown; we
        // withdraw the link if we end first so long-lived parents do not
        // accumulate dead entries.
        let link = parent.attach_child(self.to_ref());
        let link_clone = link.clone();
        self.must(move || {
            link_clone.dispose();
            Ok(())
        });
    }

    pub(crate) fn install_driver<F>(&self, fut: F)
    where
        F: Future<Output = miette::Result<T>> + 'static,
    {
        super::driver::install(self, fut);
    }

    #[must_use]
    pub fn id(&self) -> u64 { self.core.id }

    /// The erased handle used for parenting and the ambient stack.
    #[must_use]
    pub fn to_ref(&self) -> JobRef {
        JobRef {
            inner: self.core.clone(),
        }
    }

    /// Settle with a value.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::AlreadyEnded`] if the job already settled.
    pub fn finish(&self, value: T) -> miette::Result<()> {
        if self.core.settle(Outcome::Value(value)) {
            Ok(())
        } else {
            Err(miette::Report::new(JobError::AlreadyEnded))
        }
    }

    /// Settle with an error.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::AlreadyEnded`] if the job already settled.
    pub fn fail(&self, error: miette::Report) -> miette::Result<()> {
        if self
            .core
            .settle(Outcome::Error(ErrorPayload::new(error)))
        {
            Ok(())
        } else {
            Err(miette::Report::new(JobError::AlreadyEnded))
        }
    }

    /// Cancel: settle with [`Outcome::Cancel`] if not already settled. A
    /// no-op afterwards.
    pub fn end(&self) { let _ = self.core.settle(Outcome::Cancel); }

    /// Cancel, then reopen the same job for reuse: the result slot is
    /// cleared, the cleanup chain is empty, and the job is re-linked to its
    /// parent (if the parent is still alive).
    pub fn restart(&self) {
        self.end();
        *self.core.result.borrow_mut() = None;
        *self.core.pending_settle.borrow_mut() = None;
        let maybe_parent = self.core.parent_erased();
        if let Some(parent) = maybe_parent {
            self.attach_to(&parent);
        }
    }

    #[must_use]
    pub fn is_ended(&self) -> bool { self.core.result.borrow().is_some() }

    pub(crate) fn result_rc(&self) -> Option<Rc<Outcome<T>>> {
        self.core.result.borrow().clone()
    }

    /// The settled outcome, if any.
    #[must_use]
    pub fn result(&self) -> Option<Outcome<T>>
    where
        T: Clone,
    {
        self.result_rc().map(|outcome| (*outcome).clone())
    }

    /// Register an unconditional cleanup; runs on end in reverse registration
    /// order. Registering after the job ended schedules the callback for the
    /// next microtask.
    pub fn must(&self, cb: impl FnOnce() -> miette::Result<()> + 'static) {
        self.on_done(move |_outcome| cb());
    }

    /// Register a cleanup that receives the job's settled outcome.
    pub fn on_done(
        &self,
        cb: impl FnOnce(&Outcome<T>) -> miette::Result<()> + 'static,
    ) {
        self.core.add_done(Box::new(cb));
    }

    /// Cleanup filtered to value settlement.
    pub fn on_value(&self, cb: impl FnOnce(&T) -> miette::Result<()> + 'static) {
        self.on_done(move |outcome| match outcome {
            Outcome::Value(value) => cb(value),
            _ => Ok(()),
        });
    }

    /// Cleanup filtered to error settlement. Observing the error marks it
    /// handled, which suppresses the async re-throw at the final hop.
    pub fn on_error(
        &self,
        cb: impl FnOnce(&ErrorPayload) -> miette::Result<()> + 'static,
    ) {
        self.on_done(move |outcome| match outcome {
            Outcome::Error(payload) => {
                payload.mark_handled();
                cb(payload)
            }
            _ => Ok(()),
        });
    }

    /// Cleanup filtered to cancellation.
    pub fn on_cancel(&self, cb: impl FnOnce() -> miette::Result<()> + 'static) {
        self.on_done(move |outcome| match outcome {
            Outcome::Cancel => cb(),
            _ => Ok(()),
        });
    }

    /// Register a cancellable cleanup; the returned [`Disposer`] withdraws it
    /// before it runs.
    pub fn release(
        &self,
        cb: impl FnOnce() -> miette::Result<()> + 'static,
    ) -> super::cleanup::Disposer {
        self.core.add_release(Box::new(cb))
    }

    /// Route an error along the async path (see [`JobRef::async_throw`]).
    pub fn async_throw(&self, error: miette::Report) {
        self.core.async_throw_erased(ErrorPayload::new(error));
    }

    /// Install (or clear, with `None`) the async-catch handler consulted by
    /// [`Job::async_throw`] before the error fails this job.
    pub fn async_catch(&self, handler: Option<AsyncCatchFn>) {
        *self.core.async_catch.borrow_mut() = handler;
    }

    /// Start a child job driving `fut`.
    pub fn start<U, F>(&self, fut: F) -> Job<U>
    where
        U: 'static,
        F: Future<Output = miette::Result<U>> + 'static,
    {
        self.to_ref().start(fut)
    }

    /// Start an empty child job (settled externally).
    #[must_use]
    pub fn start_empty<U: 'static>(&self) -> Job<U> { self.to_ref().start_empty() }

    /// Start a child job whose only content is a cleanup callback.
    pub fn start_cleanup(
        &self,
        cb: impl FnOnce() -> miette::Result<()> + 'static,
    ) -> Job<()> {
        self.to_ref().start_cleanup(cb)
    }

    /// Starting an existing job is the identity: the same job is returned,
    /// with value propagation only (no lifetime adoption).
    #[must_use]
    pub fn start_job<U: 'static>(&self, job: &Job<U>) -> Job<U> { job.clone() }
}

impl Job<()> {
    pub(crate) fn new_root() -> Job<()> {
        Job {
            core: Job::<()>::new_core(true),
        }
    }
}

/// Start a child of the current job (or of the root, at top level), driving
/// `fut`. The first driver step runs on the next microtask.
pub fn start<T, F>(fut: F) -> Job<T>
where
    T: 'static,
    F: Future<Output = miette::Result<T>> + 'static,
{
    owner_job().start(fut)
}

impl<T: 'static> JobCore<T> {
    /// Recover an owning handle. `self` is alive while the method runs, so
    /// the upgrade cannot fail.
    fn strong(&self) -> Rc<JobCore<T>> {
        self.weak_self.upgrade().expect("job core is alive")
    }

    fn self_ref(&self) -> JobRef {
        JobRef {
            inner: self.strong() as Rc<dyn ErasedJob>,
        }
    }

    /// Accept an outcome. Returns false if the job already settled (or a
    /// settle is already pending from a reentrant call).
    pub(crate) fn settle(&self, outcome: Outcome<T>) -> bool {
        if self.result.borrow().is_some() {
            return false;
        }
        if self.running.get() {
            // The driver is on the stack: defer until the poll returns.
            let mut pending = self.pending_settle.borrow_mut();
            if pending.is_some() {
                return false;
            }
            *pending = Some(outcome);
            return true;
        }
        self.do_settle(outcome);
        true
    }

    pub(crate) fn do_settle(&self, outcome: Outcome<T>) {
        {
            let mut result = self.result.borrow_mut();
            debug_assert!(result.is_none(), "job settled twice");
            *result = Some(Rc::new(outcome));
        }
        // Dropping the driver releases the suspended future and everything it
        // owns (timers, registrations). A late wake finds nothing to step.
        self.driver.borrow_mut().take();
        unregister_steppable(self.id);

        self.run_cleanup_sweep();

        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waker in waiters {
            waker.wake();
        }

        // Unhandled error results surviving the cleanup chain escalate to the
        // parent (observers during the sweep may have marked them handled).
        let maybe_unhandled = {
            let result = self.result.borrow();
            result.as_ref().and_then(|outcome| match &**outcome {
                Outcome::Error(payload) if !payload.is_handled() => Some(payload.clone()),
                _ => None,
            })
        };
        if let Some(payload) = maybe_unhandled {
            self.dispatch_up(payload);
        }
    }

    fn run_cleanup_sweep(&self) {
        let outcome = self.result.borrow().clone();
        let Some(outcome) = outcome else { return };

        // Phase 1: descendants, most recently started first. Each child runs
        // its own three phases to completion here, so the whole subtree is
        // flagged canceled and torn down before any of this job's own
        // callbacks fire, regardless of registration order.
        loop {
            let maybe_child = self.children.borrow_mut().pop();
            let Some(entry) = maybe_child else { break };
            if !entry.disposed.get() {
                entry.job.end();
            }
        }

        // Phase 2: the release chain, newest first, skipping disposed
        // entries.
        loop {
            let maybe_entry = self.releases.borrow_mut().pop();
            let Some(entry) = maybe_entry else { break };
            if entry.disposed.get() {
                continue;
            }
            let run_result = {
                let _guard = push_frame(Frame::for_job(self.self_ref()));
                (entry.cb)()
            };
            if let Err(error) = run_result {
                self.async_throw_erased(ErrorPayload::new(error));
            }
        }

        // Phase 3: the must chain, newest first, receiving the outcome.
        loop {
            let maybe_cb = self.musts.borrow_mut().pop();
            let Some(cb) = maybe_cb else { break };
            let run_result = {
                let _guard = push_frame(Frame::for_job(self.self_ref()));
                cb(&outcome)
            };
            if let Err(error) = run_result {
                self.async_throw_erased(ErrorPayload::new(error));
            }
        }
    }

    fn add_done(&self, cb: DoneFn<T>) {
        let settled = self.result.borrow().clone();
        match settled {
            // Register-after-end: run on the next microtask, with errors
            // routed the same way as sweep-time cleanup errors.
            Some(outcome) => {
                let core = self.strong();
                defer(move || {
                    let run_result = {
                        let _guard = push_frame(Frame::for_job(core.self_ref()));
                        cb(&outcome)
                    };
                    if let Err(error) = run_result {
                        core.async_throw_erased(ErrorPayload::new(error));
                    }
                });
            }
            None => self.musts.borrow_mut().push(cb),
        }
    }

    fn add_release(&self, cb: CleanupFn) -> super::cleanup::Disposer {
        let disposer = super::cleanup::Disposer::new();
        let disposed = disposer.bit();
        let settled = self.result.borrow().is_some();
        if settled {
            let core = self.strong();
            defer(move || {
                if disposed.get() {
                    return;
                }
                let run_result = {
                    let _guard = push_frame(Frame::for_job(core.self_ref()));
                    cb()
                };
                if let Err(error) = run_result {
                    core.async_throw_erased(ErrorPayload::new(error));
                }
            });
        } else {
            self.releases
                .borrow_mut()
                .push(ReleaseEntry { disposed, cb });
        }
        disposer
    }

    /// Register a sweep-time observer that marks an error outcome handled.
    /// Used by the future bridge: an awaiter takes responsibility for the
    /// error before the post-sweep escalation check runs.
    pub(crate) fn add_handled_marker(&self) {
        if self.result.borrow().is_some() {
            return;
        }
        self.musts.borrow_mut().push(Box::new(|outcome| {
            if let Outcome::Error(payload) = outcome {
                payload.mark_handled();
            }
            Ok(())
        }));
    }

    fn dispatch_up(&self, payload: ErrorPayload) {
        match self.parent_erased() {
            Some(parent) => parent.async_throw_payload(payload),
            None => report_unhandled(&payload),
        }
    }
}

impl<T: 'static> ErasedJob for JobCore<T> {
    fn id(&self) -> u64 { self.id }

    fn end_erased(&self) { let _ = self.settle(Outcome::Cancel); }

    fn is_ended_erased(&self) -> bool { self.result.borrow().is_some() }

    fn async_throw_erased(&self, payload: ErrorPayload) {
        let taken_handler = self.async_catch.borrow_mut().take();
        match taken_handler {
            Some(handler) => {
                match handler(payload.clone()) {
                    Ok(()) => {
                        // Reinstall unless the handler replaced itself.
                        let mut slot = self.async_catch.borrow_mut();
                        if slot.is_none() {
                            *slot = Some(handler);
                        }
                    }
                    Err(second) => {
                        // A failing handler is removed; both errors go up.
                        self.dispatch_up(payload);
                        self.dispatch_up(ErrorPayload::new(second));
                    }
                }
            }
            None => {
                if self.is_root {
                    report_unhandled(&payload);
                } else if !self.settle(Outcome::Error(payload.clone())) {
                    // Already settled: escalate instead.
                    self.dispatch_up(payload);
                }
            }
        }
    }

    fn must_erased(&self, cb: CleanupFn) {
        self.add_done(Box::new(move |_outcome| cb()));
    }

    fn release_erased(&self, cb: CleanupFn) -> super::cleanup::Disposer {
        self.add_release(cb)
    }

    fn attach_child_erased(&self, child: JobRef) -> super::cleanup::Disposer {
        let disposer = super::cleanup::Disposer::new();
        let disposed = disposer.bit();
        if self.result.borrow().is_some() {
            // Attaching to an ended parent: the child is canceled on the
            // next microtask, mirroring register-after-end for cleanups.
            defer(move || {
                if !disposed.get() {
                    child.end();
                }
            });
        } else {
            self.children
                .borrow_mut()
                .push(ChildEntry { job: child, disposed });
        }
        disposer
    }

    fn parent_erased(&self) -> Option<JobRef> {
        let upgraded = self
            .parent
            .borrow()
            .as_ref()
            .and_then(std::rc::Weak::upgrade);
        upgraded.map(|inner| JobRef { inner })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use pretty_assertions::assert_eq;

    use super::{super::context::{new_root, root_job},
                *};
    use crate::tick;

    fn log_cell() -> Rc<RefCell<Vec<&'static str>>> { Rc::new(RefCell::new(vec![])) }

    #[test]
    fn test_finish_settles_once_and_rejects_later_settles() {
        let root = new_root();
        let job = root.start_empty::<i32>();

        job.finish(42).unwrap();
        assert!(job.is_ended());
        assert!(matches!(job.result(), Some(Outcome::Value(42))));

        let again = job.finish(43);
        assert!(again.is_err());
        let failed = job.fail(miette::miette!("late"));
        assert!(failed.is_err());

        // `end` after settle is an idempotent no-op.
        job.end();
        assert!(matches!(job.result(), Some(Outcome::Value(42))));
    }

    #[test]
    fn test_end_settles_with_cancel() {
        let root = new_root();
        let job = root.start_empty::<i32>();
        job.end();
        assert!(matches!(job.result(), Some(Outcome::Cancel)));
    }

    #[test]
    fn test_cleanup_order_child_release_must() {
        let root = new_root();
        let log = log_cell();

        let job = root.start_empty::<()>();
        let log_a = log.clone();
        job.must(move || {
            log_a.borrow_mut().push("A");
            Ok(())
        });
        let log_b = log.clone();
        job.must(move || {
            log_b.borrow_mut().push("B");
            Ok(())
        });
        let log_c = log.clone();
        job.release(move || {
            log_c.borrow_mut().push("C");
            Ok(())
        });
        let child = job.start_empty::<()>();
        let log_d = log.clone();
        child.must(move || {
            log_d.borrow_mut().push("D");
            Ok(())
        });

        job.end();
        assert_eq!(*log.borrow(), vec!["D", "C", "B", "A"]);
        assert!(child.is_ended());
        assert!(matches!(child.result(), Some(Outcome::Cancel)));
    }

    #[test]
    fn test_descendants_precede_musts_registered_after_child_start() {
        let root = new_root();
        let log = log_cell();

        // Interleave cleanup registrations with the child start: the child
        // phase and the release chain must still run before every parent
        // `must`, and the `must`s in reverse registration order.
        let job = root.start_empty::<()>();
        let log_a = log.clone();
        job.must(move || {
            log_a.borrow_mut().push("A");
            Ok(())
        });
        let child = job.start_empty::<()>();
        let log_d = log.clone();
        child.must(move || {
            log_d.borrow_mut().push("D");
            Ok(())
        });
        let log_c = log.clone();
        job.release(move || {
            log_c.borrow_mut().push("C");
            Ok(())
        });
        let log_b = log.clone();
        job.must(move || {
            log_b.borrow_mut().push("B");
            Ok(())
        });

        job.end();
        assert_eq!(*log.borrow(), vec!["D", "C", "B", "A"]);
    }

    #[test]
    fn test_disposed_release_does_not_run() {
        let root = new_root();
        let log = log_cell();

        let job = root.start_empty::<()>();
        let log_kept = log.clone();
        let _kept = job.release(move || {
            log_kept.borrow_mut().push("kept");
            Ok(())
        });
        let log_dropped = log.clone();
        let disposer = job.release(move || {
            log_dropped.borrow_mut().push("dropped");
            Ok(())
        });
        disposer.dispose();

        job.end();
        assert_eq!(*log.borrow(), vec!["kept"]);
    }

    #[test]
    fn test_register_after_end_runs_on_next_microtask() {
        let root = new_root();
        let log = log_cell();

        let job = root.start_empty::<()>();
        job.end();

        let log_late = log.clone();
        job.must(move || {
            log_late.borrow_mut().push("late");
            Ok(())
        });
        assert!(log.borrow().is_empty());

        tick();
        assert_eq!(*log.borrow(), vec!["late"]);
    }

    #[test]
    fn test_on_value_on_error_on_cancel_filtering() {
        let root = new_root();
        let log = log_cell();

        let succeeded = root.start_empty::<i32>();
        let log_v = log.clone();
        succeeded.on_value(move |value| {
            assert_eq!(*value, 7);
            log_v.borrow_mut().push("value");
            Ok(())
        });
        let log_v_cancel = log.clone();
        succeeded.on_cancel(move || {
            log_v_cancel.borrow_mut().push("cancel?");
            Ok(())
        });
        succeeded.finish(7).unwrap();

        let canceled = root.start_empty::<i32>();
        let log_c = log.clone();
        canceled.on_cancel(move || {
            log_c.borrow_mut().push("cancel");
            Ok(())
        });
        canceled.end();

        assert_eq!(*log.borrow(), vec!["value", "cancel"]);
    }

    #[test]
    fn test_on_error_marks_handled() {
        let root = new_root();
        let job = root.start_empty::<i32>();
        let seen = Rc::new(std::cell::Cell::new(false));
        let seen_clone = seen.clone();
        job.on_error(move |_payload| {
            seen_clone.set(true);
            Ok(())
        });

        crate::job::context::push_error_capture();
        job.fail(miette::miette!("boom")).unwrap();
        let escalated = crate::job::context::pop_error_capture();

        assert!(seen.get());
        // The observer accepted responsibility; nothing reached the root.
        assert!(escalated.is_empty());
    }

    #[test]
    fn test_unobserved_error_escalates_to_root() {
        let root = new_root();
        let job = root.start_empty::<i32>();

        crate::job::context::push_error_capture();
        job.fail(miette::miette!("nobody listening")).unwrap();
        let escalated = crate::job::context::pop_error_capture();
        assert_eq!(escalated.len(), 1);
    }

    #[test]
    fn test_async_catch_intercepts_and_stays_installed() {
        let root = new_root();
        let job = root.start_empty::<i32>();
        let caught = Rc::new(RefCell::new(vec![]));
        let caught_clone = caught.clone();
        job.async_catch(Some(Box::new(move |payload| {
            caught_clone.borrow_mut().push(format!("{payload}"));
            Ok(())
        })));

        job.async_throw(miette::miette!("first"));
        job.async_throw(miette::miette!("second"));

        assert_eq!(*caught.borrow(), vec!["first", "second"]);
        assert!(!job.is_ended());
    }

    #[test]
    fn test_failing_async_catch_is_removed_and_both_errors_go_up() {
        let root = new_root();
        let job = root.start_empty::<i32>();
        job.async_catch(Some(Box::new(|_payload| {
            Err(miette::miette!("handler broke"))
        })));

        crate::job::context::push_error_capture();
        job.async_throw(miette::miette!("original"));
        let escalated = crate::job::context::pop_error_capture();
        // Both the original error and the handler's error were dispatched.
        assert_eq!(escalated.len(), 2);

        // The handler is gone: the next async throw fails the job itself.
        job.async_throw(miette::miette!("third"));
        assert!(job.is_ended());
    }

    #[test]
    fn test_ending_parent_ends_children_depth_first() {
        let root = new_root();
        let parent = root.start_empty::<()>();
        let child = parent.start_empty::<()>();
        let grandchild = child.start_empty::<()>();

        parent.end();
        assert!(parent.is_ended());
        assert!(child.is_ended());
        assert!(grandchild.is_ended());
    }

    #[test]
    fn test_child_ending_first_detaches_from_parent() {
        let root = new_root();
        let parent = root.start_empty::<()>();
        let child = parent.start_empty::<()>();
        child.end();

        let log = log_cell();
        let log_p = log.clone();
        parent.must(move || {
            log_p.borrow_mut().push("parent");
            Ok(())
        });
        parent.end();
        assert_eq!(*log.borrow(), vec!["parent"]);
    }

    #[test]
    fn test_restart_reopens_for_reuse() {
        let root = new_root();
        let job = root.start_empty::<i32>();
        let log = log_cell();
        let log_first = log.clone();
        job.must(move || {
            log_first.borrow_mut().push("first-gen");
            Ok(())
        });

        job.restart();
        assert_eq!(*log.borrow(), vec!["first-gen"]);
        assert!(!job.is_ended());

        job.finish(5).unwrap();
        assert!(matches!(job.result(), Some(Outcome::Value(5))));
        // Parent link was re-established: ending the root is still safe.
        root.end();
    }

    #[test]
    fn test_start_job_returns_same_job() {
        let root = new_root();
        let job = root.start_empty::<i32>();
        let same = root.start_job(&job);
        assert_eq!(job.id(), same.id());
    }

    #[test]
    fn test_current_job_inside_cleanup() {
        let root = new_root();
        let job = root.start_empty::<()>();
        let job_id = job.id();
        let observed = Rc::new(std::cell::Cell::new(0));
        let observed_clone = observed.clone();
        job.must(move || {
            let current = crate::current_job()?;
            observed_clone.set(current.id());
            Ok(())
        });
        job.end();
        assert_eq!(observed.get(), job_id);
    }

    #[test]
    fn test_root_job_is_ambient_owner() {
        let root = new_root();
        let job = crate::job::context::owner_job();
        assert_eq!(job.id(), root.id());
        assert_eq!(root_job().id(), root.id());
    }
}
