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

//! The future bridge: `job.await` from any async context.
//!
//! Awaiting resolves with the job's value, fails with its error, or fails
//! with a typed [`crate::CancelError`] on cancellation. Awaiting counts as
//! observing the error (it is marked handled, suppressing the async re-throw
//! at the final hop).
//!
//! Polling from the host executor also pumps the runtime, so a test (or any
//! Tokio task) that awaits a job drives every pending driver step and
//! microtask. Polls that happen while the runtime is already pumping (a job
//! awaiting another job) skip the pump and just park on the waiter list.

use std::{future::{Future, IntoFuture},
          pin::Pin,
          task::{Context, Poll}};

use super::job::Job;
use crate::{is_pumping, tick, wake_hub, Outcome};

/// Future returned by awaiting a [`Job`].
#[derive(Debug)]
pub struct JobFuture<T: 'static> {
    job: Job<T>,
    registered: bool,
}

impl<T: Clone + 'static> Future for JobFuture<T> {
    type Output = miette::Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.registered {
            this.registered = true;
            // Take responsibility for the error before it can escalate.
            this.job.core.add_handled_marker();
        }

        let pumping_elsewhere = is_pumping();
        if !pumping_elsewhere {
            tick();
        }

        if let Some(outcome) = this.job.result_rc() {
            return Poll::Ready(match &*outcome {
                Outcome::Value(value) => Ok(value.clone()),
                Outcome::Error(payload) => {
                    payload.mark_handled();
                    Err(payload.to_report())
                }
                Outcome::Cancel => Err(miette::Report::new(crate::CancelError)),
            });
        }

        this.job.core.waiters.borrow_mut().push(cx.waker().clone());
        if !pumping_elsewhere {
            let hub = wake_hub();
            hub.set_host_waker(cx.waker().clone());
            // A wake may have landed between the pump and the registration;
            // self-wake so the executor polls again rather than parking.
            if hub.has_pending_wakes() {
                cx.waker().wake_by_ref();
            }
        }
        Poll::Pending
    }
}

impl<T: Clone + 'static> IntoFuture for Job<T> {
    type Output = miette::Result<T>;
    type IntoFuture = JobFuture<T>;

    fn into_future(self) -> JobFuture<T> {
        JobFuture {
            job: self,
            registered: false,
        }
    }
}
