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

//! Cleanup chain entries and the [`Disposer`] returned by
//! [`crate::Job::release`].
//!
//! Each job keeps its child jobs, its release chain, and its must chain
//! separately, and ending the job tears them down in three phases: child
//! jobs first (most recently started first, each run to completion), then
//! release entries, then must entries, the chains in reverse registration
//! order. Because descendants are a phase of their own, they are flagged
//! canceled and fully torn down before any of the ancestor's `must`
//! callbacks run, no matter how cleanup registrations and child starts were
//! interleaved.

use std::{cell::Cell, rc::Rc};

use crate::Outcome;

/// A cleanup callback receiving the settled outcome of its job.
pub(crate) type DoneFn<T> = Box<dyn FnOnce(&Outcome<T>) -> miette::Result<()>>;

/// A plain cleanup callback.
pub(crate) type CleanupFn = Box<dyn FnOnce() -> miette::Result<()>>;

/// A release-chain entry: runs on end unless the holder disposed it first.
pub(crate) struct ReleaseEntry {
    pub disposed: Rc<Cell<bool>>,
    pub cb: CleanupFn,
}

/// Cancels a `release` cleanup. The disposed bit is shared with the chain
/// entry and checked immediately before the callback would run, so disposing
/// during an end sweep means the callback either runs or it does not, never
/// twice.
#[derive(Debug, Clone)]
pub struct Disposer {
    disposed: Rc<Cell<bool>>,
}

impl Disposer {
    pub(crate) fn new() -> Self {
        Self {
            disposed: Rc::new(Cell::new(false)),
        }
    }

    pub(crate) fn bit(&self) -> Rc<Cell<bool>> { self.disposed.clone() }

    /// Cancel the associated cleanup. Idempotent.
    pub fn dispose(&self) { self.disposed.set(true); }

    #[must_use]
    pub fn is_disposed(&self) -> bool { self.disposed.get() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposer_bit_is_shared() {
        let disposer = Disposer::new();
        let bit = disposer.bit();
        assert!(!bit.get());

        disposer.dispose();
        assert!(bit.get());
        assert!(disposer.is_disposed());

        // Idempotent.
        disposer.dispose();
        assert!(disposer.is_disposed());
    }
}
