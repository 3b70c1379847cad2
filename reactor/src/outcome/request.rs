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

//! One-shot settlement requests.
//!
//! A [`Request`] is handed to an asynchronous operation (a timer, an event
//! registration, a suspended job) which later settles it exactly once via
//! [`resolve`] or [`reject`]. Second settlements are silent no-ops, which is
//! what makes the suspend protocol safe against double callbacks from host
//! APIs.

use std::{cell::{Cell, RefCell},
          rc::Rc};

use super::{ErrorPayload, Outcome};

type SettleFn<T> = Box<dyn FnOnce(Outcome<T>)>;

/// A one-shot settlement primitive. Cloning yields another handle to the same
/// request; whichever handle settles first wins.
pub struct Request<T> {
    inner: Rc<RequestState<T>>,
}

struct RequestState<T> {
    settled: Cell<bool>,
    waiter: RefCell<Option<SettleFn<T>>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("settled", &self.inner.settled.get())
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Request<T> {
    /// Create a request whose settlement invokes `on_settle` (at most once).
    pub fn new(on_settle: impl FnOnce(Outcome<T>) + 'static) -> Self {
        Self {
            inner: Rc::new(RequestState {
                settled: Cell::new(false),
                waiter: RefCell::new(Some(Box::new(on_settle))),
            }),
        }
    }

    #[must_use]
    pub fn is_settled(&self) -> bool { self.inner.settled.get() }

    /// A bound single-use resolve callback, for handing to host APIs that
    /// want a plain `FnOnce(T)`.
    #[must_use]
    pub fn resolver(&self) -> impl FnOnce(T) + 'static {
        let request = self.clone();
        move |value| resolve(&request, value)
    }

    /// A bound single-use reject callback.
    #[must_use]
    pub fn rejecter(&self) -> impl FnOnce(miette::Report) + 'static {
        let request = self.clone();
        move |error| reject(&request, error)
    }

    fn settle(&self, outcome: Outcome<T>) {
        if self.inner.settled.replace(true) {
            return;
        }
        // Take the waiter out before invoking it, so a reentrant settle from
        // inside the callback observes the request as already settled.
        let maybe_waiter = self.inner.waiter.borrow_mut().take();
        if let Some(waiter) = maybe_waiter {
            waiter(outcome);
        }
    }
}

/// Settle `request` with a value. A no-op if the request already settled.
pub fn resolve<T: 'static>(request: &Request<T>, value: T) {
    request.settle(Outcome::Value(value));
}

/// Settle `request` with an error. A no-op if the request already settled.
pub fn reject<T: 'static>(request: &Request<T>, error: miette::Report) {
    request.settle(Outcome::Error(ErrorPayload::new(error)));
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_resolve_settles_once() {
        let seen: Rc<RefCell<Vec<Outcome<i32>>>> = Rc::new(RefCell::new(vec![]));
        let seen_clone = seen.clone();
        let request = Request::new(move |outcome| seen_clone.borrow_mut().push(outcome));

        resolve(&request, 1);
        resolve(&request, 2);
        reject(&request, miette::miette!("late"));

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value(), Some(&1));
    }

    #[test]
    fn test_reject_settles_with_error() {
        let seen: Rc<RefCell<Vec<Outcome<i32>>>> = Rc::new(RefCell::new(vec![]));
        let seen_clone = seen.clone();
        let request = Request::new(move |outcome| seen_clone.borrow_mut().push(outcome));

        reject(&request, miette::miette!("boom"));
        assert!(request.is_settled());
        assert!(seen.borrow()[0].is_error());
    }

    #[test]
    fn test_bound_resolver_is_single_use() {
        let seen: Rc<RefCell<Vec<Outcome<i32>>>> = Rc::new(RefCell::new(vec![]));
        let seen_clone = seen.clone();
        let request = Request::new(move |outcome| seen_clone.borrow_mut().push(outcome));

        let settle = request.resolver();
        settle(42);
        assert_eq!(seen.borrow()[0].value(), Some(&42));

        // A second bound callback is a no-op after settlement.
        let late = request.resolver();
        late(99);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_reentrant_settle_from_waiter_is_ignored() {
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        let slot: Rc<RefCell<Option<Request<i32>>>> = Rc::new(RefCell::new(None));
        let slot_clone = slot.clone();

        let request = Request::new(move |_outcome| {
            count_clone.set(count_clone.get() + 1);
            if let Some(request) = slot_clone.borrow().as_ref() {
                resolve(request, 99);
            }
        });
        *slot.borrow_mut() = Some(request.clone());

        resolve(&request, 1);
        assert_eq!(count.get(), 1);
    }
}
