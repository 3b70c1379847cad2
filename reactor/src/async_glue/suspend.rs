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

//! The suspend protocol: pause a job until a one-shot [`Request`] settles.
//!
//! `suspend_with(op)` hands `op` a request and suspends until some callback
//! settles it (the function-valued yield of the runtime). Settling
//! synchronously inside `op` resumes without a suspension; settling twice is
//! a no-op; ending the job drops the suspended future, after which a late
//! settlement goes nowhere.

use std::{cell::RefCell,
          future::Future,
          pin::Pin,
          rc::Rc,
          task::{Context, Poll, Waker}};

use crate::{job::context::owner_job, resolve, CancelError, Inlet, Outcome, Request};

struct SuspendShared<T> {
    outcome: Option<Outcome<T>>,
    waker: Option<Waker>,
}

/// Future returned by [`suspend_with`].
pub struct SuspendFuture<T: 'static> {
    op: Option<Box<dyn FnOnce(Request<T>)>>,
    shared: Rc<RefCell<SuspendShared<T>>>,
}

impl<T: 'static> std::fmt::Debug for SuspendFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendFuture")
            .field("armed", &self.op.is_none())
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Future for SuspendFuture<T> {
    type Output = miette::Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(op) = this.op.take() {
            let shared = this.shared.clone();
            let request = Request::new(move |outcome| {
                let mut shared = shared.borrow_mut();
                shared.outcome = Some(outcome);
                if let Some(waker) = shared.waker.take() {
                    waker.wake();
                }
            });
            op(request);
        }

        let maybe_outcome = this.shared.borrow_mut().outcome.take();
        match maybe_outcome {
            Some(Outcome::Value(value)) => Poll::Ready(Ok(value)),
            Some(Outcome::Error(payload)) => Poll::Ready(Err(payload.to_report())),
            Some(Outcome::Cancel) => {
                Poll::Ready(Err(miette::Report::new(CancelError)))
            }
            None => {
                this.shared.borrow_mut().waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Suspend until the request handed to `op` settles. At most one resumption
/// per suspend.
pub fn suspend_with<T: 'static>(
    op: impl FnOnce(Request<T>) + 'static,
) -> SuspendFuture<T> {
    SuspendFuture {
        op: Some(Box::new(op)),
        shared: Rc::new(RefCell::new(SuspendShared {
            outcome: None,
            waker: None,
        })),
    }
}

/// Suspend forever: resumes only by the job ending (which drops the future).
pub fn suspend<T>() -> std::future::Pending<T> { std::future::pending() }

/// Wait for the inlet's next transition to ready. Registered under the
/// current job, so ending the job withdraws the registration.
///
/// # Errors
///
/// Fails with [`CancelError`] if the registration is canceled.
pub async fn await_ready(inlet: &Inlet) -> miette::Result<()> {
    let inlet = inlet.clone();
    suspend_with(move |request: Request<()>| {
        let job = owner_job();
        inlet.on_ready(
            move || {
                resolve(&request, ());
                Ok(())
            },
            &job,
        );
    })
    .await
}
