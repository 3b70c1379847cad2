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

//! Stream sources: thin adapters that feed values into a conduit under
//! backpressure.
//!
//! Every source releases its native resources (iterators, timers, tap
//! registrations) through `must` cleanups on the conduit, so tearing down
//! the conduit is always enough to stop production.

use std::{cell::RefCell, rc::Rc, time::Duration};

use super::{core::{Sink, Stream},
            inlet::Inlet};
use crate::{await_ready, sleep, Job, Outcome};

/// A stream that completes immediately without emitting.
#[must_use]
pub fn empty<T: 'static>() -> Stream<T> {
    Stream::new(|_sink, conn, _inlet| {
        let _ = conn.finish(());
        Ok(())
    })
}

/// A stream that never emits and never completes (until canceled).
#[must_use]
pub fn never<T: 'static>() -> Stream<T> {
    Stream::new(|_sink, _conn, _inlet| Ok(()))
}

/// Emit each item of an iterable, pacing production through the inlet: one
/// batch per `on_ready` firing, re-registering while paused. Completes with a
/// value when the iterator is exhausted; the iterator is dropped exactly once
/// (on completion or conduit end).
pub fn from_iter<T, I>(iterable: I) -> Stream<T>
where
    T: 'static,
    I: IntoIterator<Item = T> + Clone + 'static,
    I::IntoIter: 'static,
{
    Stream::new(move |sink, conn, inlet| {
        let state = Rc::new(RefCell::new(Some(iterable.clone().into_iter())));
        let cleanup_state = state.clone();
        conn.must(move || {
            cleanup_state.borrow_mut().take();
            Ok(())
        });
        arm_iter_pump(state, sink, conn.clone(), inlet.clone());
        Ok(())
    })
}

fn arm_iter_pump<T, I>(
    state: Rc<RefCell<Option<I>>>,
    sink: Sink<T>,
    conn: Job<()>,
    inlet: Inlet,
) where
    T: 'static,
    I: Iterator<Item = T> + 'static,
{
    let conn_ref = conn.to_ref();
    let inlet_for_register = inlet.clone();
    inlet_for_register.on_ready(
        move || {
            loop {
                if conn.is_ended() {
                    return Ok(());
                }
                if !inlet.is_ready() {
                    // Paused mid-batch: keep our place and wait for resume.
                    arm_iter_pump(state, sink, conn, inlet);
                    return Ok(());
                }
                let next_item = state.borrow_mut().as_mut().and_then(Iterator::next);
                match next_item {
                    Some(item) => sink.send(item)?,
                    None => {
                        state.borrow_mut().take();
                        let _ = conn.finish(());
                        return Ok(());
                    }
                }
            }
        },
        &conn_ref,
    );
}

/// Emit `0, 1, 2, …` every `period`, pausing with the inlet. The timer lives
/// inside the conduit's child job, so it is released when the conduit ends.
#[must_use]
pub fn interval(period: Duration) -> Stream<u64> {
    Stream::new(move |sink, conn, inlet| {
        let inlet = inlet.clone();
        conn.start::<(), _>(async move {
            let mut tick_number: u64 = 0;
            loop {
                sleep(period).await;
                if !inlet.is_ready() {
                    await_ready(&inlet).await?;
                }
                sink.send(tick_number)?;
                tick_number += 1;
            }
        });
        Ok(())
    })
}

/// Emit the job's value then complete; propagate its error; end silently on
/// its cancellation.
pub fn from_job<T: Clone + 'static>(job: &Job<T>) -> Stream<T> {
    let job = job.clone();
    Stream::new(move |sink, conn, _inlet| {
        let conn = conn.clone();
        let sink = sink.clone();
        job.on_done(move |outcome| {
            if conn.is_ended() {
                return Ok(());
            }
            match outcome {
                Outcome::Value(value) => {
                    sink.send(value.clone())?;
                    let _ = conn.finish(());
                    Ok(())
                }
                Outcome::Error(payload) => {
                    // The conduit takes responsibility for reporting.
                    payload.mark_handled();
                    let _ = conn.fail(payload.to_report());
                    Ok(())
                }
                Outcome::Cancel => {
                    conn.end();
                    Ok(())
                }
            }
        });
        Ok(())
    })
}

struct EmitterTap<T> {
    sink: Sink<T>,
    conn: Job<()>,
    inlet: Inlet,
}

/// Imperative push source: whatever is [`Emitter::emit`]ted is delivered
/// synchronously to every connected, ready conduit. Values emitted while a
/// tap is paused are dropped for that tap (live-stream semantics).
pub struct Emitter<T> {
    taps: Rc<RefCell<Vec<EmitterTap<T>>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            taps: self.taps.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("taps", &self.taps.borrow().len())
            .finish()
    }
}

impl<T: Clone + 'static> Emitter<T> {
    /// Push one value to every live, ready tap.
    pub fn emit(&self, value: T) {
        self.taps.borrow_mut().retain(|tap| !tap.conn.is_ended());
        let snapshot: Vec<(Sink<T>, Job<()>, Inlet)> = self
            .taps
            .borrow()
            .iter()
            .map(|tap| (tap.sink.clone(), tap.conn.clone(), tap.inlet.clone()))
            .collect();
        for (sink, conn, inlet) in snapshot {
            if conn.is_ended() || !inlet.is_ready() {
                continue;
            }
            if let Err(error) = sink.send(value.clone()) {
                let _ = conn.fail(error);
            }
        }
    }

    /// Complete every connected conduit with a value result.
    pub fn complete(&self) {
        let taps = std::mem::take(&mut *self.taps.borrow_mut());
        for tap in taps {
            let _ = tap.conn.finish(());
        }
    }
}

/// An emitter and the stream fed by it.
pub fn emitter<T: Clone + 'static>() -> (Emitter<T>, Stream<T>) {
    let taps: Rc<RefCell<Vec<EmitterTap<T>>>> = Rc::new(RefCell::new(Vec::new()));
    let emitter = Emitter { taps: taps.clone() };

    let stream = Stream::new(move |sink, conn, inlet| {
        taps.borrow_mut().push(EmitterTap {
            sink,
            conn: conn.clone(),
            inlet: inlet.clone(),
        });
        let taps_for_cleanup = taps.clone();
        let conn_id = conn.id();
        conn.must(move || {
            taps_for_cleanup
                .borrow_mut()
                .retain(|tap| tap.conn.id() != conn_id);
            Ok(())
        });
        Ok(())
    });

    (emitter, stream)
}
