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

//! A generic batched work queue.
//!
//! Rule queues, the pull queue, and the demand-change queue are all instances
//! of this one contract:
//!
//! - [`BatchQueue::add`] is idempotent and schedules a flush (via the injected
//!   scheduling function) only on the transition from empty-and-unscheduled.
//! - [`BatchQueue::delete`] removes an item without touching the schedule.
//! - [`BatchQueue::flush`] is reentrancy-guarded. The reap function must
//!   remove items as it processes them (via [`BatchQueue::pop`]); if items
//!   remain when it returns (an error exit, or deliberate throttling), a new
//!   flush is scheduled before `flush` returns.
//! - The scheduling function fires at most once per outstanding "scheduled"
//!   flag: `flush` consumes the flag on entry.

use std::{cell::{Cell, RefCell},
          collections::VecDeque,
          rc::Rc};

type SameFn<T> = Box<dyn Fn(&T, &T) -> bool>;
type ScheduleFn<T> = Box<dyn Fn(&BatchQueue<T>)>;
type ReapFn<T> = Box<dyn Fn(&BatchQueue<T>)>;

/// A batched work queue with injected scheduling and reaping. Cloning yields
/// another handle to the same queue.
pub struct BatchQueue<T> {
    inner: Rc<BatchQueueInner<T>>,
}

struct BatchQueueInner<T> {
    items: RefCell<VecDeque<T>>,
    same: SameFn<T>,
    schedule: ScheduleFn<T>,
    reap: ReapFn<T>,
    scheduled: Cell<bool>,
    running: Cell<bool>,
}

impl<T> Clone for BatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for BatchQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchQueue")
            .field("len", &self.inner.items.borrow().len())
            .field("scheduled", &self.inner.scheduled.get())
            .field("running", &self.inner.running.get())
            .finish()
    }
}

impl<T: 'static> BatchQueue<T> {
    /// `same` decides item identity (for idempotent add and for delete).
    /// `schedule` arranges a future call to [`BatchQueue::flush`]. `reap`
    /// processes the live set, removing items as it goes.
    pub fn new(
        same: impl Fn(&T, &T) -> bool + 'static,
        schedule: impl Fn(&BatchQueue<T>) + 'static,
        reap: impl Fn(&BatchQueue<T>) + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(BatchQueueInner {
                items: RefCell::new(VecDeque::new()),
                same: Box::new(same),
                schedule: Box::new(schedule),
                reap: Box::new(reap),
                scheduled: Cell::new(false),
                running: Cell::new(false),
            }),
        }
    }

    /// Add `item` if an identical one is not already queued. Schedules a
    /// flush only when the queue was empty and no flush is outstanding.
    pub fn add(&self, item: T) {
        let was_empty = {
            let mut items = self.inner.items.borrow_mut();
            if items.iter().any(|queued| (self.inner.same)(queued, &item)) {
                return;
            }
            let was_empty = items.is_empty();
            items.push_back(item);
            was_empty
        };

        if was_empty && !self.inner.scheduled.get() {
            self.inner.scheduled.set(true);
            (self.inner.schedule)(self);
        }
    }

    /// Remove `item` without altering the schedule.
    pub fn delete(&self, item: &T) {
        let mut items = self.inner.items.borrow_mut();
        if let Some(position) = items.iter().position(|queued| (self.inner.same)(queued, item)) {
            items.remove(position);
        }
    }

    /// Remove and return the oldest item. Reap functions drain with this.
    pub fn pop(&self) -> Option<T> { self.inner.items.borrow_mut().pop_front() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.inner.items.borrow().is_empty() }

    #[must_use]
    pub fn is_scheduled(&self) -> bool { self.inner.scheduled.get() }

    #[must_use]
    pub fn is_running(&self) -> bool { self.inner.running.get() }

    /// Run the reap function over the live set. Returns immediately if a
    /// flush is already running. Reschedules if the reap left items behind.
    pub fn flush(&self) {
        if self.inner.running.get() {
            return;
        }
        self.inner.scheduled.set(false);
        self.inner.running.set(true);
        (self.inner.reap)(self);
        self.inner.running.set(false);

        if !self.is_empty() && !self.inner.scheduled.get() {
            self.inner.scheduled.set(true);
            (self.inner.schedule)(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn counting_queue(
        schedule_count: Rc<Cell<usize>>,
        reaped: Rc<RefCell<Vec<i32>>>,
    ) -> BatchQueue<i32> {
        BatchQueue::new(
            |a, b| a == b,
            move |_queue| schedule_count.set(schedule_count.get() + 1),
            move |queue| {
                while let Some(item) = queue.pop() {
                    reaped.borrow_mut().push(item);
                }
            },
        )
    }

    #[test]
    fn test_add_is_idempotent() {
        let schedule_count = Rc::new(Cell::new(0));
        let reaped = Rc::new(RefCell::new(vec![]));
        let queue = counting_queue(schedule_count.clone(), reaped.clone());

        queue.add(1);
        queue.add(1);
        queue.add(2);

        queue.flush();
        assert_eq!(*reaped.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_schedule_fires_only_on_empty_unscheduled_transition() {
        let schedule_count = Rc::new(Cell::new(0));
        let reaped = Rc::new(RefCell::new(vec![]));
        let queue = counting_queue(schedule_count.clone(), reaped);

        queue.add(1);
        queue.add(2);
        queue.add(3);
        assert_eq!(schedule_count.get(), 1);

        queue.flush();
        queue.add(4);
        assert_eq!(schedule_count.get(), 2);
    }

    #[test]
    fn test_delete_removes_without_unscheduling() {
        let schedule_count = Rc::new(Cell::new(0));
        let reaped = Rc::new(RefCell::new(vec![]));
        let queue = counting_queue(schedule_count, reaped.clone());

        queue.add(1);
        queue.add(2);
        queue.delete(&1);
        assert!(queue.is_scheduled());

        queue.flush();
        assert_eq!(*reaped.borrow(), vec![2]);
    }

    #[test]
    fn test_flush_reschedules_when_reap_leaves_items() {
        let schedule_count = Rc::new(Cell::new(0));
        let schedule_count_clone = schedule_count.clone();
        // A throttling reap: processes exactly one item per flush.
        let reaped = Rc::new(RefCell::new(vec![]));
        let reaped_clone = reaped.clone();
        let queue = BatchQueue::new(
            |a: &i32, b: &i32| a == b,
            move |_queue| schedule_count_clone.set(schedule_count_clone.get() + 1),
            move |queue| {
                if let Some(item) = queue.pop() {
                    reaped_clone.borrow_mut().push(item);
                }
            },
        );

        queue.add(1);
        queue.add(2);
        assert_eq!(schedule_count.get(), 1);

        queue.flush();
        assert_eq!(*reaped.borrow(), vec![1]);
        // Leftover item 2 caused a reschedule.
        assert_eq!(schedule_count.get(), 2);
        assert!(queue.is_scheduled());

        queue.flush();
        assert_eq!(*reaped.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_flush_is_reentrancy_guarded() {
        let reentered = Rc::new(Cell::new(false));
        let reentered_clone = reentered.clone();
        let queue: Rc<RefCell<Option<BatchQueue<i32>>>> = Rc::new(RefCell::new(None));
        let queue_clone = queue.clone();

        let q = BatchQueue::new(
            |a: &i32, b: &i32| a == b,
            |_queue| {},
            move |current| {
                while let Some(_item) = current.pop() {
                    if let Some(same_queue) = queue_clone.borrow().as_ref() {
                        // Reentrant flush must return immediately.
                        same_queue.flush();
                        reentered_clone.set(same_queue.is_running());
                    }
                }
            },
        );
        *queue.borrow_mut() = Some(q.clone());

        q.add(1);
        q.flush();
        assert!(reentered.get());
        assert!(!q.is_running());
    }
}
