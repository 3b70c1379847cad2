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

//! Push-to-pull bridging: consume a push [`Stream`] as an async pull stream
//! ([`futures_core::Stream`]), with the inlet pausing the source while a
//! value waits to be consumed.

use std::{cell::{Cell, RefCell},
          collections::VecDeque,
          rc::Rc,
          task::{Poll, Waker}};

use crate::{connect, Outcome, Sink, Stream};

struct Notify {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Notify {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            fired: Cell::new(false),
            waker: RefCell::new(None),
        })
    }

    fn notify(&self) {
        self.fired.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    /// Wait for a notification, pumping the runtime while doing so (the
    /// consumer may be the only task driving the microtask queue).
    async fn wait(&self) {
        std::future::poll_fn(|cx| {
            if !crate::is_pumping() {
                crate::tick();
            }
            if self.fired.replace(false) {
                return Poll::Ready(());
            }
            *self.waker.borrow_mut() = Some(cx.waker().clone());
            if !crate::is_pumping() {
                let hub = crate::wake_hub();
                hub.set_host_waker(cx.waker().clone());
                if hub.has_pending_wakes() {
                    cx.waker().wake_by_ref();
                }
            }
            Poll::Pending
        })
        .await;
    }
}

/// Iterate a push stream from async code:
///
/// ```ignore
/// let mut items = std::pin::pin!(each(&source));
/// while let Some(item) = items.next().await { ... }
/// ```
///
/// The conduit lives as long as the returned stream is being consumed; the
/// inlet pauses the source whenever a value is buffered, giving slack-1
/// backpressure.
pub fn each<T: 'static>(
    stream: &Stream<T>,
) -> impl futures_core::Stream<Item = miette::Result<T>> + use<T> {
    let stream = stream.clone();
    async_stream::stream! {
        let buffer: Rc<RefCell<VecDeque<T>>> = Rc::new(RefCell::new(VecDeque::new()));
        let notify = Notify::new();
        // Owned by the enclosing job: the consumer controls pause/resume.
        let inlet = crate::throttle();

        let conn = {
            let buffer_for_sink = buffer.clone();
            let notify_for_sink = notify.clone();
            let inlet_for_sink = inlet.clone();
            let conn = connect(
                &stream,
                Sink::new(move |value| {
                    buffer_for_sink.borrow_mut().push_back(value);
                    // Hold the source until the consumer drains the buffer.
                    inlet_for_sink.pause();
                    notify_for_sink.notify();
                    Ok(())
                }),
                Some(inlet.clone()),
            );
            let notify_on_end = notify.clone();
            conn.must(move || {
                notify_on_end.notify();
                Ok(())
            });
            // The consumer observes the error by yielding it.
            conn.on_error(|_payload| Ok(()));
            conn
        };

        loop {
            let maybe_value = buffer.borrow_mut().pop_front();
            if let Some(value) = maybe_value {
                if buffer.borrow().is_empty() && !conn.is_ended() {
                    inlet.resume();
                }
                yield Ok(value);
                continue;
            }
            if let Some(outcome) = conn.result() {
                match outcome {
                    Outcome::Value(()) | Outcome::Cancel => break,
                    Outcome::Error(payload) => {
                        payload.mark_handled();
                        yield Err(payload.to_report());
                        break;
                    }
                }
            }
            notify.wait().await;
        }
    }
}

/// Connect a stream to a fallible closure sink in a child job of the current
/// job. Returns the conduit.
pub fn for_each<T: 'static>(
    stream: &Stream<T>,
    f: impl Fn(T) -> miette::Result<()> + 'static,
) -> crate::Job<()> {
    connect(stream, Sink::new(f), None)
}
