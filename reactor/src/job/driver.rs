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

//! The driver that advances a job's future, one step per wake.
//!
//! Invariants:
//! - The first step runs on the next microtask after [`install`], never
//!   synchronously inside `start`.
//! - One resumption per suspend: a wake delivers exactly one poll; duplicate
//!   wakes coalesce behind the job's id in the wake hub.
//! - A settled job's future is dropped; late wakes find nothing to step.
//! - `finish`/`fail`/`end` calls made while the driver is on the stack are
//!   deferred and applied after the poll returns (the deferred settle wins
//!   over a `Ready` produced by the same poll only if it arrives first).

use std::{future::Future,
          pin::Pin,
          rc::Rc,
          sync::Arc,
          task::{Context, Poll, Wake, Waker}};

use super::{context::{push_frame, Frame},
            job::{Job, JobCore}};
use crate::{defer, register_steppable, wake_hub, ErrorPayload, Outcome, Steppable,
            WakeHub};

pub(crate) struct DriverState<T> {
    future: Pin<Box<dyn Future<Output = miette::Result<T>>>>,
    step_count: u64,
}

/// Wakes a job by id through the shared hub. `Send + Sync` as required by
/// [`Waker`]; the actual step always runs on the runtime thread.
struct JobWaker {
    id: u64,
    hub: Arc<WakeHub>,
}

impl Wake for JobWaker {
    fn wake(self: Arc<Self>) { self.hub.wake_id(self.id); }

    fn wake_by_ref(self: &Arc<Self>) { self.hub.wake_id(self.id); }
}

/// Attach `fut` as the job's driver and schedule the first step.
pub(crate) fn install<T, F>(job: &Job<T>, fut: F)
where
    T: 'static,
    F: Future<Output = miette::Result<T>> + 'static,
{
    *job.core.driver.borrow_mut() = Some(DriverState {
        future: Box::pin(fut),
        step_count: 0,
    });
    let steppable: Rc<dyn Steppable> = job.core.clone();
    register_steppable(job.core.id, Rc::downgrade(&steppable));

    let core = job.core.clone();
    defer(move || core.step_driver());
}

impl<T: 'static> Steppable for JobCore<T> {
    fn step_driver(self: Rc<Self>) {
        if self.result.borrow().is_some() || self.running.get() {
            return;
        }
        let Some(mut driver) = self.driver.borrow_mut().take() else {
            return;
        };

        self.running.set(true);
        driver.step_count += 1;
        let poll = {
            let _guard = push_frame(Frame::for_job(Job { core: self.clone() }.to_ref()));
            let waker = Waker::from(Arc::new(JobWaker {
                id: self.id,
                hub: wake_hub(),
            }));
            let mut cx = Context::from_waker(&waker);
            driver.future.as_mut().poll(&mut cx)
        };
        self.running.set(false);

        match poll {
            Poll::Ready(Ok(value)) => {
                // Release the finished future before cleanups run.
                drop(driver);
                let _ = self.settle(Outcome::Value(value));
            }
            Poll::Ready(Err(error)) => {
                drop(driver);
                let _ = self.settle(Outcome::Error(ErrorPayload::new(error)));
            }
            Poll::Pending => {
                let deferred = self.pending_settle.borrow().is_some();
                if deferred {
                    drop(driver);
                } else {
                    *self.driver.borrow_mut() = Some(driver);
                }
            }
        }

        let maybe_deferred = self.pending_settle.borrow_mut().take();
        if let Some(outcome) = maybe_deferred {
            let _ = self.settle(outcome);
        }
    }
}
