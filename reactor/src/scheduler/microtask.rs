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

//! The microtask queue and wake routing for the single-threaded runtime.
//!
//! All runtime state is thread-local; handles are `Rc`-based and never cross
//! threads. The one exception is [`WakeHub`]: job wakers must satisfy the
//! `Send + Sync` bound of [`std::task::Waker`] so that Tokio timers and I/O
//! resources can wake a job. A wake therefore only records the woken job's id
//! in the hub and nudges the registered host waker; the actual driver step
//! runs later, on this thread, when [`tick`] (or a polled job future) pumps.
//!
//! Borrow discipline: no thread-local `RefCell` borrow is ever held across a
//! callback into user code.

use std::{cell::{Cell, RefCell},
          collections::{HashMap, VecDeque},
          rc::{Rc, Weak},
          sync::{Arc, Mutex, MutexGuard, PoisonError},
          task::Waker};

type Microtask = Box<dyn FnOnce()>;

/// Anything the pump can step when its wake id comes up. Implemented by the
/// job driver.
pub(crate) trait Steppable {
    fn step_driver(self: Rc<Self>);
}

/// Shared wake state. `Send + Sync` so it can live inside a [`Waker`].
#[derive(Debug, Default)]
pub(crate) struct WakeHub {
    /// Ids of jobs woken since the last pump.
    pending: Mutex<Vec<u64>>,
    /// The waker of whoever is awaiting the runtime from the host executor.
    host: Mutex<Option<Waker>>,
}

impl WakeHub {
    /// Record a wake for `id` and nudge the host so it re-polls and pumps.
    pub(crate) fn wake_id(&self, id: u64) {
        lock_or_recover(&self.pending).push(id);
        self.wake_host();
    }

    pub(crate) fn wake_host(&self) {
        if let Some(waker) = lock_or_recover(&self.host).take() {
            waker.wake();
        }
    }

    pub(crate) fn set_host_waker(&self, waker: Waker) {
        *lock_or_recover(&self.host) = Some(waker);
    }

    fn drain_pending(&self) -> Vec<u64> {
        std::mem::take(&mut *lock_or_recover(&self.pending))
    }

    pub(crate) fn has_pending_wakes(&self) -> bool {
        !lock_or_recover(&self.pending).is_empty()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

thread_local! {
    static MICROTASKS: RefCell<VecDeque<Microtask>> = RefCell::new(VecDeque::new());
    static HUB: Arc<WakeHub> = Arc::new(WakeHub::default());
    static STEP_REGISTRY: RefCell<HashMap<u64, Weak<dyn Steppable>>> =
        RefCell::new(HashMap::new());
    static PUMPING: Cell<bool> = const { Cell::new(false) };
    static NEXT_ID: Cell<u64> = const { Cell::new(1) };
}

/// Allocate a runtime-unique id (jobs, cells, queues).
pub(crate) fn next_id() -> u64 {
    NEXT_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    })
}

pub(crate) fn wake_hub() -> Arc<WakeHub> { HUB.with(Arc::clone) }

pub(crate) fn register_steppable(id: u64, steppable: Weak<dyn Steppable>) {
    STEP_REGISTRY.with(|registry| registry.borrow_mut().insert(id, steppable));
}

pub(crate) fn unregister_steppable(id: u64) {
    STEP_REGISTRY.with(|registry| registry.borrow_mut().remove(&id));
}

fn lookup_steppable(id: u64) -> Option<Rc<dyn Steppable>> {
    STEP_REGISTRY.with(|registry| registry.borrow().get(&id).and_then(Weak::upgrade))
}

/// True while [`tick`] is draining. Nested pump attempts (eg: a job future
/// polled from inside another job's driver step) must not re-enter.
pub(crate) fn is_pumping() -> bool { PUMPING.with(Cell::get) }

/// Schedule `cb` to run on the next microtask.
///
/// Microtasks run in FIFO order when the runtime is pumped: explicitly via
/// [`tick`], or implicitly whenever a job future is polled by the host
/// executor.
pub fn defer(cb: impl FnOnce() + 'static) {
    MICROTASKS.with(|queue| queue.borrow_mut().push_back(Box::new(cb)));
    // If nobody pumps right now, make sure the host comes back to us.
    if !is_pumping() {
        HUB.with(|hub| hub.wake_host());
    }
}

/// Pump the runtime until quiescent: deliver pending wakes as driver steps,
/// then drain the microtask queue, repeating until both are empty.
///
/// Reentrant calls (from inside a microtask or a driver step) are no-ops; the
/// outermost pump picks up whatever they enqueued.
pub fn tick() {
    if PUMPING.with(|flag| flag.replace(true)) {
        return;
    }

    loop {
        let mut did_work = false;

        let woken = HUB.with(|hub| hub.drain_pending());
        for id in woken {
            if let Some(steppable) = lookup_steppable(id) {
                did_work = true;
                steppable.step_driver();
            }
        }

        loop {
            let maybe_task = MICROTASKS.with(|queue| queue.borrow_mut().pop_front());
            let Some(task) = maybe_task else { break };
            did_work = true;
            task();
        }

        if !did_work {
            break;
        }
    }

    PUMPING.with(|flag| flag.set(false));
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defer_runs_in_fifo_order_on_tick() {
        let log: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(vec![]));

        let log_a = log.clone();
        defer(move || log_a.borrow_mut().push("a"));
        let log_b = log.clone();
        defer(move || log_b.borrow_mut().push("b"));

        assert!(log.borrow().is_empty());
        tick();
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_microtasks_enqueued_during_tick_run_in_same_tick() {
        let log: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(vec![]));

        let log_outer = log.clone();
        defer(move || {
            log_outer.borrow_mut().push("outer");
            let log_inner = log_outer.clone();
            defer(move || log_inner.borrow_mut().push("inner"));
        });

        tick();
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_reentrant_tick_is_a_no_op() {
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        defer(move || {
            // Reentering the pump from inside a microtask must not recurse.
            tick();
            count_clone.set(count_clone.get() + 1);
        });

        tick();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_next_id_is_monotonic() {
        let first = next_id();
        let second = next_id();
        assert!(second > first);
    }
}
