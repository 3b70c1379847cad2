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

//! End-to-end async scenarios for the job engine: timer-driven settlement
//! with a paused clock, the future bridge, the suspend protocol, and jobs
//! awaiting jobs.

use std::{cell::{Cell, RefCell},
          rc::Rc,
          time::Duration};

use pretty_assertions::assert_eq;
use r3bl_reactor::{new_root, resolve, sleep, start, suspend_with, tick, CancelError,
                   JobError, Outcome, Request};

#[tokio::test(start_paused = true)]
async fn test_sleep_and_return_settles_at_exact_deadline() {
    let _root = new_root();
    let job = start(async {
        sleep(Duration::from_millis(50)).await;
        Ok::<_, miette::Report>(42)
    });

    // First driver step arms the timer.
    tick();
    assert!(job.result().is_none());

    tokio::time::advance(Duration::from_millis(49)).await;
    tick();
    assert!(job.result().is_none());

    tokio::time::advance(Duration::from_millis(1)).await;
    tick();
    assert!(matches!(job.result(), Some(Outcome::Value(42))));

    // Awaiters resume with the value.
    assert_eq!(job.clone().await.unwrap(), 42);
}

#[tokio::test]
async fn test_await_bridge_value_error_cancel() {
    let _root = new_root();

    let ok_job = start(async { Ok::<_, miette::Report>("done") });
    assert_eq!(ok_job.await.unwrap(), "done");

    let err_job = start(async { Err::<i32, _>(miette::miette!("exploded")) });
    let error = err_job.await.unwrap_err();
    assert_eq!(format!("{error}"), "exploded");

    let canceled_job = start(async {
        sleep(Duration::from_secs(3600)).await;
        Ok::<_, miette::Report>(0)
    });
    tick();
    canceled_job.end();
    let error = canceled_job.await.unwrap_err();
    assert!(error.downcast_ref::<CancelError>().is_some());
}

#[tokio::test]
async fn test_suspend_with_resolves_via_bound_resolver() {
    let _root = new_root();

    let handoff: Rc<RefCell<Option<Request<i32>>>> = Rc::new(RefCell::new(None));
    let handoff_clone = handoff.clone();
    let job = start(async move {
        let value = suspend_with(move |request| {
            *handoff_clone.borrow_mut() = Some(request);
        })
        .await?;
        Ok::<_, miette::Report>(value + 1)
    });

    tick();
    let request = handoff.borrow_mut().take().expect("job suspended");
    resolve(&request, 41);
    // Duplicate settlements are no-ops.
    resolve(&request, 99);

    assert_eq!(job.await.unwrap(), 42);
}

#[tokio::test]
async fn test_suspend_with_synchronous_settle_does_not_suspend() {
    let _root = new_root();
    let job = start(async {
        let value =
            suspend_with(|request: Request<i32>| resolve(&request, 7)).await?;
        Ok::<_, miette::Report>(value)
    });
    assert_eq!(job.await.unwrap(), 7);
}

#[tokio::test]
async fn test_job_awaiting_job() {
    let _root = new_root();
    let inner = start(async {
        sleep(Duration::from_millis(1)).await;
        Ok::<_, miette::Report>(10)
    });

    let inner_clone = inner.clone();
    let outer = start(async move {
        let inner_value = inner_clone.await?;
        Ok::<_, miette::Report>(inner_value * 2)
    });

    assert_eq!(outer.await.unwrap(), 20);
}

#[tokio::test]
async fn test_reentrant_end_inside_driver_is_deferred() {
    let _root = new_root();
    let slot: Rc<RefCell<Option<r3bl_reactor::Job<i32>>>> =
        Rc::new(RefCell::new(None));
    let slot_clone = slot.clone();

    let job = start(async move {
        // End ourselves while the driver is on the stack.
        if let Some(own_job) = slot_clone.borrow().as_ref() {
            own_job.end();
        }
        // The deferred settle wins; this value is never used.
        sleep(Duration::from_secs(3600)).await;
        Ok::<_, miette::Report>(1)
    });
    *slot.borrow_mut() = Some(job.clone());

    tick();
    assert!(matches!(job.result(), Some(Outcome::Cancel)));
}

#[tokio::test]
async fn test_canceled_job_receives_no_further_resumptions() {
    let _root = new_root();
    let resumed = Rc::new(Cell::new(false));

    let resumed_clone = resumed.clone();
    let handoff: Rc<RefCell<Option<Request<()>>>> = Rc::new(RefCell::new(None));
    let handoff_clone = handoff.clone();
    let job = start(async move {
        suspend_with(move |request| {
            *handoff_clone.borrow_mut() = Some(request);
        })
        .await?;
        resumed_clone.set(true);
        Ok::<_, miette::Report>(())
    });

    tick();
    job.end();

    // A late settlement must not resume the dropped future.
    if let Some(request) = handoff.borrow_mut().take() {
        resolve(&request, ());
    }
    tick();
    assert!(!resumed.get());
}

#[tokio::test]
async fn test_ending_parent_cancels_running_child_timer() {
    let _root = new_root();
    let parent = start(async {
        sleep(Duration::from_secs(3600)).await;
        Ok::<_, miette::Report>(())
    });
    tick();

    let child = parent.start(async {
        sleep(Duration::from_secs(3600)).await;
        Ok::<_, miette::Report>(())
    });
    tick();

    parent.end();
    assert!(child.is_ended());
    assert!(matches!(child.result(), Some(Outcome::Cancel)));
}

#[tokio::test]
async fn test_finish_after_settle_reports_already_ended() {
    let _root = new_root();
    let job = start(async { Ok::<_, miette::Report>(1) });
    tick();

    let error = job.finish(2).unwrap_err();
    assert!(matches!(
        error.downcast_ref::<JobError>(),
        Some(JobError::AlreadyEnded)
    ));
}
