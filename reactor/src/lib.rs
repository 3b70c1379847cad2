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

//! # `r3bl_reactor`
//!
//! A structured-concurrency and reactive-signals runtime for a
//! single-threaded cooperative event loop, built on Tokio's current-thread
//! runtime. Three tightly integrated engines share one ambient context
//! stack, one result/cancellation model, and one microtask scheduler:
//!
//! 1. **Jobs**: cancellable asynchronous tasks with hierarchical lifetime.
//!    A [`Job`] drives a future, settles exactly once with an [`Outcome`]
//!    (value, error, or cancel), and runs its cleanup chain on end:
//!    descendants first, `must` callbacks in reverse registration order.
//!    Errors that outlive their stack escalate along the parent chain
//!    ([`Job::async_throw`] → [`Job::async_catch`] → parent → … → root).
//!
//! 2. **Signals**: a push/pull reactive value graph. [`value`] cells are
//!    mutable leaves, [`cached`] cells are pure computed functions, and
//!    [`rule`]s are side-effecting observers batched onto rule queues and
//!    drained glitch-free: a timestamp discipline plus write-conflict
//!    detection guarantee every rule observes a mutually consistent
//!    snapshot. Dependencies are maintained on demand: unobserved computed
//!    chains cost nothing to keep.
//!
//! 3. **Streams**: lazy, pausable push sources ([`Stream`]) whose
//!    subscription lifetime is a job (the *conduit*, made by [`connect`]),
//!    with backpressure expressed through an [`Inlet`] and bridges in both
//!    directions to the signal graph ([`from_stream`],
//!    [`Value::to_stream`]).
//!
//! ## Example
//!
//! ```no_run
//! use r3bl_reactor::{run_rules, rule, start, value};
//!
//! # async fn demo() -> miette::Result<()> {
//! let counter = value(0);
//!
//! let counter_for_rule = counter.clone();
//! rule(move || {
//!     println!("counter is {}", counter_for_rule.get()?);
//!     Ok(())
//! });
//! run_rules()?; // prints "counter is 0"
//!
//! counter.set(1)?;
//! counter.set(2)?;
//! run_rules()?; // prints "counter is 2" (once)
//!
//! let job = start(async move {
//!     // any future can run inside a job; ending the job cancels it
//!     Ok::<_, miette::Report>(42)
//! });
//! assert_eq!(job.await?, 42);
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading model
//!
//! Single-threaded cooperative: all runtime state is thread-local, handles
//! are `Rc`-based and `!Send`. The only asynchrony is the microtask queue
//! ([`defer`], pumped by [`tick`] or by awaiting any job) and host timers.
//! Wakers are `Send + Sync` as the [`std::task::Waker`] contract requires,
//! but every driver step, rule, sink, and cleanup runs on the owning thread.

#![cfg_attr(not(test), deny(clippy::unwrap_in_result))]

// Attach sources.
pub mod async_glue;
pub mod job;
pub mod outcome;
pub mod scheduler;
pub mod signal;
pub mod stream;
pub mod tracing_support;

// Re-export.
pub use async_glue::*;
pub use job::*;
pub use outcome::*;
pub use scheduler::*;
pub use signal::*;
pub use stream::*;
pub use tracing_support::*;

// Crate-internal plumbing shared across the subsystems.
pub(crate) use scheduler::microtask::{is_pumping, next_id, register_steppable,
                                      unregister_steppable, wake_hub, Steppable,
                                      WakeHub};
