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

//! Stream operators.
//!
//! Operators compose by wrapping the sink (sharing the caller's conduit and
//! inlet) or by running their inputs in sub-conduits linked to the caller's
//! conduit. Either way, ending the outer conduit tears everything down.

use std::{cell::{Cell, RefCell},
          rc::Rc};

use super::{core::{connect_on, Sink, Stream},
            inlet::Inlet};
use crate::{job::context::{push_frame, root_job, Frame},
            Job, Outcome};

impl<T: 'static> Stream<T> {
    /// Transform each value.
    #[must_use]
    pub fn map<U: 'static>(
        self,
        f: impl Fn(T) -> miette::Result<U> + 'static,
    ) -> Stream<U> {
        let f = Rc::new(f);
        Stream::new(move |sink, conn, inlet| {
            let f = f.clone();
            self.run(Sink::new(move |value| sink.send(f(value)?)), conn, inlet)
        })
    }

    /// Keep only values matching the predicate.
    #[must_use]
    pub fn filter(self, predicate: impl Fn(&T) -> bool + 'static) -> Stream<T> {
        let predicate = Rc::new(predicate);
        Stream::new(move |sink, conn, inlet| {
            let predicate = predicate.clone();
            self.run(
                Sink::new(move |value| {
                    if predicate(&value) {
                        sink.send(value)
                    } else {
                        Ok(())
                    }
                }),
                conn,
                inlet,
            )
        })
    }

    /// Emit the first `n` values, then complete the conduit with a value
    /// result.
    #[must_use]
    pub fn take(self, n: usize) -> Stream<T> {
        Stream::new(move |sink, conn, inlet| {
            if n == 0 {
                let _ = conn.finish(());
                return Ok(());
            }
            let remaining = Rc::new(Cell::new(n));
            let conn_guard = conn.clone();
            self.run(
                Sink::new(move |value| {
                    if conn_guard.is_ended() {
                        return Ok(());
                    }
                    let left = remaining.get();
                    if left == 0 {
                        return Ok(());
                    }
                    sink.send(value)?;
                    remaining.set(left - 1);
                    if left == 1 {
                        let _ = conn_guard.finish(());
                    }
                    Ok(())
                }),
                conn,
                inlet,
            )
        })
    }

    /// Drop the first `n` values.
    #[must_use]
    pub fn skip(self, n: usize) -> Stream<T> {
        Stream::new(move |sink, conn, inlet| {
            let remaining = Rc::new(Cell::new(n));
            self.run(
                Sink::new(move |value| {
                    let left = remaining.get();
                    if left > 0 {
                        remaining.set(left - 1);
                        Ok(())
                    } else {
                        sink.send(value)
                    }
                }),
                conn,
                inlet,
            )
        })
    }

    /// Emit values until `notifier` emits anything, then complete with a
    /// value result. The notifier runs in a sub-conduit of the caller's
    /// conduit; no value reaches the sink after the notification.
    #[must_use]
    pub fn take_until<S: 'static>(self, notifier: Stream<S>) -> Stream<T> {
        Stream::new(move |sink, conn, inlet| {
            let conn_for_notify = conn.clone();
            let stop_sink = Sink::new(move |_trigger: S| {
                let _ = conn_for_notify.finish(());
                Ok(())
            });
            connect_on(&conn.to_ref(), &notifier, stop_sink, None);

            let conn_guard = conn.clone();
            self.run(
                Sink::new(move |value| {
                    if conn_guard.is_ended() {
                        Ok(())
                    } else {
                        sink.send(value)
                    }
                }),
                conn,
                inlet,
            )
        })
    }

    /// Drop values until `notifier` emits anything.
    #[must_use]
    pub fn skip_until<S: 'static>(self, notifier: Stream<S>) -> Stream<T> {
        Stream::new(move |sink, conn, inlet| {
            let gate_open = Rc::new(Cell::new(false));
            let gate_for_notify = gate_open.clone();
            let open_sink = Sink::new(move |_trigger: S| {
                gate_for_notify.set(true);
                Ok(())
            });
            connect_on(&conn.to_ref(), &notifier, open_sink, None);

            self.run(
                Sink::new(move |value| {
                    if gate_open.get() {
                        sink.send(value)
                    } else {
                        Ok(())
                    }
                }),
                conn,
                inlet,
            )
        })
    }

    /// Run this stream to completion, then `other`; complete when the second
    /// completes. Errors and cancellation propagate from either.
    #[must_use]
    pub fn concat_with(self, other: Stream<T>) -> Stream<T> {
        Stream::new(move |sink, conn, inlet| {
            let first_conn = connect_on(
                &conn.to_ref(),
                &self,
                sink.clone(),
                Some(inlet.clone()),
            );
            let other = other.clone();
            let sink = sink.clone();
            let inlet = inlet.clone();
            let conn = conn.clone();
            first_conn.on_done(move |outcome| {
                match outcome {
                    Outcome::Value(()) => {
                        let second_conn =
                            connect_on(&conn.to_ref(), &other, sink, Some(inlet));
                        let conn_after = conn.clone();
                        second_conn.on_done(move |second_outcome| {
                            match second_outcome {
                                Outcome::Value(()) => {
                                    let _ = conn_after.finish(());
                                }
                                Outcome::Error(payload) => {
                                    let _ = conn_after.fail(payload.to_report());
                                }
                                Outcome::Cancel => {}
                            }
                            Ok(())
                        });
                    }
                    Outcome::Error(payload) => {
                        let _ = conn.fail(payload.to_report());
                    }
                    Outcome::Cancel => {}
                }
                Ok(())
            });
            Ok(())
        })
    }

    /// Interleave this stream with `other`; complete when both complete.
    #[must_use]
    pub fn merge_with(self, other: Stream<T>) -> Stream<T> {
        Stream::new(move |sink, conn, inlet| {
            let open_count = Rc::new(Cell::new(2_usize));
            for stream in [self.clone(), other.clone()] {
                let sub_conn = connect_on(
                    &conn.to_ref(),
                    &stream,
                    sink.clone(),
                    Some(inlet.clone()),
                );
                let open_count = open_count.clone();
                let conn = conn.clone();
                sub_conn.on_done(move |outcome| {
                    match outcome {
                        Outcome::Value(()) => {
                            open_count.set(open_count.get() - 1);
                            if open_count.get() == 0 {
                                let _ = conn.finish(());
                            }
                        }
                        Outcome::Error(payload) => {
                            let _ = conn.fail(payload.to_report());
                        }
                        Outcome::Cancel => {}
                    }
                    Ok(())
                });
            }
            Ok(())
        })
    }

    /// Multicast: one upstream conduit shared by every downstream. The
    /// upstream pauses when all downstreams have paused and resumes when any
    /// resumes; paused downstreams miss values in between.
    #[must_use]
    pub fn share(self) -> Stream<T>
    where
        T: Clone,
    {
        let state = Rc::new(ShareState::<T> {
            upstream: RefCell::new(None),
            taps: RefCell::new(Vec::new()),
        });
        let upstream_stream = Rc::new(self);

        Stream::new(move |sink, conn, inlet| {
            state.taps.borrow_mut().push(ShareTap {
                sink,
                conn: conn.clone(),
                inlet: inlet.clone(),
            });

            let state_for_cleanup = state.clone();
            let conn_id = conn.id();
            conn.must(move || {
                let mut taps = state_for_cleanup.taps.borrow_mut();
                taps.retain(|tap| tap.conn.id() != conn_id);
                if taps.is_empty() {
                    drop(taps);
                    if let Some((upstream_conn, _inlet)) =
                        state_for_cleanup.upstream.borrow_mut().take()
                    {
                        upstream_conn.end();
                    }
                }
                Ok(())
            });

            let needs_upstream = state.upstream.borrow().is_none();
            if needs_upstream {
                let upstream_parent = root_job().to_ref();
                let upstream_conn = upstream_parent.start_empty::<()>();
                let upstream_inlet = Inlet::for_job(upstream_conn.to_ref());
                let fan_out = ShareState::fan_out_sink(&state, &upstream_inlet);
                *state.upstream.borrow_mut() =
                    Some((upstream_conn.clone(), upstream_inlet.clone()));
                let run_result = {
                    let _guard = push_frame(Frame {
                        job: Some(upstream_conn.to_ref()),
                        cell: None,
                        inlet: Some(upstream_inlet.clone()),
                    });
                    upstream_stream.run(fan_out, &upstream_conn, &upstream_inlet)
                };
                if let Err(error) = run_result {
                    let _ = upstream_conn.fail(error);
                }
            }
            Ok(())
        })
    }
}

struct ShareTap<T> {
    sink: Sink<T>,
    conn: Job<()>,
    inlet: Inlet,
}

struct ShareState<T> {
    upstream: RefCell<Option<(Job<()>, Inlet)>>,
    taps: RefCell<Vec<ShareTap<T>>>,
}

impl<T: Clone + 'static> ShareState<T> {
    fn fan_out_sink(state: &Rc<ShareState<T>>, upstream_inlet: &Inlet) -> Sink<T> {
        let state = state.clone();
        let upstream_inlet = upstream_inlet.clone();
        Sink::new(move |value: T| {
            state.taps.borrow_mut().retain(|tap| !tap.conn.is_ended());
            let snapshot: Vec<(Sink<T>, Job<()>, Inlet)> = state
                .taps
                .borrow()
                .iter()
                .map(|tap| (tap.sink.clone(), tap.conn.clone(), tap.inlet.clone()))
                .collect();

            let mut any_ready = false;
            for (tap_sink, tap_conn, tap_inlet) in snapshot {
                if tap_conn.is_ended() {
                    continue;
                }
                if tap_inlet.is_ready() {
                    any_ready = true;
                    if let Err(error) = tap_sink.send(value.clone()) {
                        let _ = tap_conn.fail(error);
                    }
                } else {
                    // Wake the upstream when this downstream resumes.
                    let wake_upstream = upstream_inlet.clone();
                    tap_inlet.on_ready(
                        move || {
                            wake_upstream.resume();
                            Ok(())
                        },
                        &tap_conn.to_ref(),
                    );
                }
            }
            if !any_ready {
                upstream_inlet.pause();
            }
            Ok(())
        })
    }
}
