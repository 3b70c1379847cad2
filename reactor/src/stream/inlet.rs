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

//! The backpressure controller bridging sink readiness and source production.
//!
//! Sources that can pace themselves register [`Inlet::on_ready`] callbacks
//! and emit one batch per firing. Each registration fires at most once and
//! must re-register to continue. [`Inlet::resume`] drains the callbacks that
//! were pending at the moment of the call, in registration order, each
//! removed before it fires; registrations made during the drain are observed
//! on the next resume (or pull-queue flush), never dropped.

use std::{cell::{Cell, RefCell},
          collections::VecDeque,
          rc::Rc};

use crate::{defer, job::context::owner_job, BatchQueue, Disposer, JobRef};

type ReadyFn = Box<dyn FnOnce() -> miette::Result<()>>;

struct ReadyEntry {
    cb: ReadyFn,
    job: JobRef,
    disposed: Rc<Cell<bool>>,
    /// The auto-remove hook registered on `job`; disposed after firing.
    job_link: Disposer,
}

struct InletInner {
    paused: Cell<bool>,
    owner: JobRef,
    pending: RefCell<VecDeque<ReadyEntry>>,
}

/// Backpressure inlet/throttle. Cloning yields another handle to the same
/// inlet.
#[derive(Clone)]
pub struct Inlet {
    inner: Rc<InletInner>,
}

impl std::fmt::Debug for Inlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inlet")
            .field("open", &self.is_open())
            .field("ready", &self.is_ready())
            .field("pending", &self.inner.pending.borrow().len())
            .finish()
    }
}

impl Inlet {
    pub(crate) fn for_job(owner: JobRef) -> Self {
        Self {
            inner: Rc::new(InletInner {
                paused: Cell::new(false),
                owner,
                pending: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// False once the owning job has ended.
    #[must_use]
    pub fn is_open(&self) -> bool { !self.inner.owner.is_ended() }

    /// False while paused or closed.
    #[must_use]
    pub fn is_ready(&self) -> bool { self.is_open() && !self.inner.paused.get() }

    /// Register `cb` to fire on the next transition to ready (or on the next
    /// pull-queue flush if the inlet is already ready). The registration is
    /// auto-removed if `job` ends first; it fires at most once.
    pub fn on_ready(
        &self,
        cb: impl FnOnce() -> miette::Result<()> + 'static,
        job: &JobRef,
    ) {
        if !self.is_open() {
            return;
        }
        let disposed = Rc::new(Cell::new(false));
        let disposed_clone = disposed.clone();
        let job_link = job.release(move || {
            disposed_clone.set(true);
            Ok(())
        });
        self.inner.pending.borrow_mut().push_back(ReadyEntry {
            cb: Box::new(cb),
            job: job.clone(),
            disposed,
            job_link,
        });
        if self.is_ready() {
            pull_queue().add(self.clone());
        }
    }

    /// Stop readiness; sources pause at their next `is_ready` check or
    /// `on_ready` round-trip.
    pub fn pause(&self) { self.inner.paused.set(true); }

    /// Become ready and synchronously drain the callbacks pending at this
    /// moment, until either the inlet is paused again or they are exhausted.
    pub fn resume(&self) {
        self.inner.paused.set(false);
        self.drain_pending();
    }

    /// Pull-queue entry point: deliver pending callbacks if currently ready.
    pub(crate) fn do_pull(&self) {
        if self.is_ready() {
            self.drain_pending();
        }
    }

    fn drain_pending(&self) {
        // Only the entries registered before this drain; later registrations
        // wait for the next resume.
        let batch_len = self.inner.pending.borrow().len();
        for _ in 0..batch_len {
            if !self.is_ready() {
                break;
            }
            let maybe_entry = self.inner.pending.borrow_mut().pop_front();
            let Some(entry) = maybe_entry else { break };
            if entry.disposed.get() || entry.job.is_ended() {
                entry.job_link.dispose();
                continue;
            }
            entry.job_link.dispose();
            if let Err(error) = (entry.cb)() {
                entry.job.async_throw(error);
            }
        }
    }
}

/// Create a standalone inlet owned by the current job (or the root at top
/// level).
#[must_use]
pub fn throttle() -> Inlet { Inlet::for_job(owner_job()) }

/// The inlet of the nearest enclosing conduit, if any. Operators use this to
/// thread backpressure through without naming the inlet explicitly.
#[must_use]
pub fn backpressure() -> Option<Inlet> { crate::job::context::current_inlet() }

thread_local! {
    static PULL_QUEUE: RefCell<Option<BatchQueue<Inlet>>> = const { RefCell::new(None) };
}

/// The queue that delivers `on_ready` registrations made while the inlet was
/// already ready. Flushed via the microtask scheduler.
fn pull_queue() -> BatchQueue<Inlet> {
    PULL_QUEUE.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.get_or_insert_with(|| {
            BatchQueue::new(
                |a: &Inlet, b: &Inlet| Rc::ptr_eq(&a.inner, &b.inner),
                |queue| {
                    let queue = queue.clone();
                    defer(move || queue.flush());
                },
                |queue| {
                    while let Some(inlet) = queue.pop() {
                        inlet.do_pull();
                    }
                },
            )
        })
        .clone()
    })
}
