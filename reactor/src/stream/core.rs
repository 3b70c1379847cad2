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

//! The stream protocol: sources, sinks, and conduits.
//!
//! A [`Stream`] wraps a source function. Connecting it starts a child job
//! (the *conduit*) and runs the source inside it with a [`Sink`] and an
//! [`Inlet`]. Sinks receive values synchronously; backpressure is expressed
//! exclusively through the inlet. A source must not push after its conduit
//! ends; the provided sources guard for that, and operators re-check before
//! forwarding.
//!
//! Conduit lifetime: ends with a value when the source signals completion,
//! with an error when the source (or the sink, while the source pushes)
//! fails, and with cancel when the parent job ends or the caller ends it.

use std::rc::Rc;

use super::inlet::Inlet;
use crate::{job::context::{owner_job, push_frame, Frame},
            Job, JobRef};

/// Marker for stream-shaped things (the source protocol).
pub trait IsStream {}

type SinkFn<T> = Rc<dyn Fn(T) -> miette::Result<()>>;

/// Receives values pushed by a source. Cloning yields another handle to the
/// same sink.
pub struct Sink<T> {
    f: SinkFn<T>,
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<T> std::fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink").finish_non_exhaustive()
    }
}

impl<T: 'static> Sink<T> {
    pub fn new(f: impl Fn(T) -> miette::Result<()> + 'static) -> Self {
        Self { f: Rc::new(f) }
    }

    /// Deliver one value synchronously.
    ///
    /// # Errors
    ///
    /// Whatever the consumer returns; sources end their conduit with this
    /// error.
    pub fn send(&self, value: T) -> miette::Result<()> { (self.f)(value) }
}

type SourceFn<T> = Rc<dyn Fn(Sink<T>, &Job<()>, &Inlet) -> miette::Result<()>>;

/// A lazy push source. Nothing runs until [`connect`]. Cloning shares the
/// source function; each connect gets its own conduit.
pub struct Stream<T> {
    source: SourceFn<T>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl<T> IsStream for Stream<T> {}

impl<T: 'static> Stream<T> {
    /// Wrap a source function. The function runs once per connect, inside
    /// the new conduit's frame; it normally registers `must` cleanups on the
    /// conduit for any native resources it arms.
    pub fn new(
        source: impl Fn(Sink<T>, &Job<()>, &Inlet) -> miette::Result<()> + 'static,
    ) -> Self {
        Self {
            source: Rc::new(source),
        }
    }

    pub(crate) fn run(
        &self,
        sink: Sink<T>,
        conn: &Job<()>,
        inlet: &Inlet,
    ) -> miette::Result<()> {
        (self.source)(sink, conn, inlet)
    }

    /// Apply one operator. `pipe` with no operators is the identity, and
    /// chained calls compose left to right.
    #[must_use]
    pub fn pipe<U>(self, op: impl FnOnce(Stream<T>) -> Stream<U>) -> Stream<U> {
        op(self)
    }
}

/// Connect `stream` to `sink` in a new conduit (a child job of the current
/// job, or of the root at top level). Returns the conduit.
pub fn connect<T: 'static>(
    stream: &Stream<T>,
    sink: Sink<T>,
    inlet: Option<Inlet>,
) -> Job<()> {
    connect_on(&owner_job(), stream, sink, inlet)
}

/// Connect under an explicit parent job.
pub fn connect_on<T: 'static>(
    parent: &JobRef,
    stream: &Stream<T>,
    sink: Sink<T>,
    inlet: Option<Inlet>,
) -> Job<()> {
    let conn = parent.start_empty::<()>();
    let inlet = inlet.unwrap_or_else(|| Inlet::for_job(conn.to_ref()));

    let run_result = {
        let _guard = push_frame(Frame {
            job: Some(conn.to_ref()),
            cell: None,
            inlet: Some(inlet.clone()),
        });
        stream.run(sink, &conn, &inlet)
    };
    if let Err(error) = run_result {
        // The source may have settled the conduit itself before failing.
        let _ = conn.fail(error);
    }
    conn
}

impl<P: 'static> Job<P> {
    /// Connect a stream in a conduit that is a child of this job.
    pub fn connect<T: 'static>(
        &self,
        stream: &Stream<T>,
        sink: Sink<T>,
        inlet: Option<Inlet>,
    ) -> Job<()> {
        connect_on(&self.to_ref(), stream, sink, inlet)
    }
}
