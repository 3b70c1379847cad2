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

//! The ambient context stack.
//!
//! Entering user code on behalf of a job pushes a job frame; entering a cell
//! computation pushes a cell frame (which may carry a distinct job, eg: a rule
//! body's job); running a stream source pushes a frame carrying the conduit's
//! inlet. Frames are popped by the [`FrameGuard`] drop, so early returns via
//! `?` cannot unbalance the stack.
//!
//! Dependency tracking consults only the **top** frame's cell: a child job
//! spawned from inside a rule body runs under its own (cell-less) frame and
//! must not record dependencies for the rule.

use std::{cell::RefCell, rc::Rc};

use crate::{signal::CellCore, ErrorPayload, Inlet, Job, JobError, JobRef};

#[derive(Default)]
pub(crate) struct Frame {
    pub job: Option<JobRef>,
    pub cell: Option<Rc<CellCore>>,
    pub inlet: Option<Inlet>,
}

impl Frame {
    pub(crate) fn for_job(job: JobRef) -> Self {
        Self {
            job: Some(job),
            ..Self::default()
        }
    }
}

thread_local! {
    static STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static ROOT: RefCell<Option<Job<()>>> = const { RefCell::new(None) };
    static ERROR_CAPTURE: RefCell<Vec<Vec<ErrorPayload>>> = const { RefCell::new(Vec::new()) };
}

/// Pops its frame on drop.
pub(crate) struct FrameGuard;

impl Drop for FrameGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[must_use]
pub(crate) fn push_frame(frame: Frame) -> FrameGuard {
    STACK.with(|stack| stack.borrow_mut().push(frame));
    FrameGuard
}

/// The nearest enclosing job on the context stack.
///
/// # Errors
///
/// Returns [`JobError::NoCurrentJob`] outside any job frame.
pub fn current_job() -> miette::Result<JobRef> {
    let found = STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find_map(|frame| frame.job.clone())
    });
    found.ok_or_else(|| miette::Report::new(JobError::NoCurrentJob))
}

/// True when some job frame is on the context stack.
#[must_use]
pub fn is_job_active() -> bool {
    STACK.with(|stack| stack.borrow().iter().any(|frame| frame.job.is_some()))
}

/// The nearest enclosing job, falling back to the root job. This is what
/// rules, conduits, and child jobs attach to when created at top level.
pub(crate) fn owner_job() -> JobRef {
    current_job().unwrap_or_else(|_| root_job().to_ref())
}

/// The cell whose computation is currently on top of the stack, if any.
pub(crate) fn current_cell() -> Option<Rc<CellCore>> {
    STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .and_then(|frame| frame.cell.clone())
    })
}

/// The nearest enclosing conduit's inlet, if any.
pub(crate) fn current_inlet() -> Option<Inlet> {
    STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find_map(|frame| frame.inlet.clone())
    })
}

/// The ambient outermost job. Created lazily; never settles on its own. It is
/// the ultimate destination of unhandled async errors.
pub fn root_job() -> Job<()> {
    ROOT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(Job::new_root());
        }
        slot.as_ref().cloned().unwrap_or_else(Job::new_root)
    })
}

/// End the prior root (running its cleanups) and install a fresh one. For
/// tests that need a pristine job tree.
pub fn new_root() -> Job<()> {
    let prior = ROOT.with(|slot| slot.borrow_mut().take());
    if let Some(prior) = prior {
        prior.end();
    }
    root_job()
}

/// Open an error-capture scope: root-level unhandled errors land in the scope
/// instead of the log, until the matching [`pop_error_capture`].
pub(crate) fn push_error_capture() {
    ERROR_CAPTURE.with(|scopes| scopes.borrow_mut().push(Vec::new()));
}

pub(crate) fn pop_error_capture() -> Vec<ErrorPayload> {
    ERROR_CAPTURE.with(|scopes| scopes.borrow_mut().pop().unwrap_or_default())
}

/// Final hop for an async error that reached the root unhandled.
pub(crate) fn report_unhandled(payload: &ErrorPayload) {
    if payload.is_handled() {
        return;
    }
    let captured = ERROR_CAPTURE.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        match scopes.last_mut() {
            Some(scope) => {
                scope.push(payload.clone());
                true
            }
            None => false,
        }
    });
    if !captured {
        tracing::error!("unhandled async error reached the root job: {:?}", payload.report());
    }
}
