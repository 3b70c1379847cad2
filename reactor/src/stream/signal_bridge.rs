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

//! Bridges between the signal graph and streams.
//!
//! - Cell → stream: [`Value::to_stream`] / [`Cached::to_stream`] create, per
//!   connect, an internal rule that pushes each distinct cell value to the
//!   sink under the sink's inlet (values coalesce to the latest while
//!   paused).
//! - Stream → cell: [`from_stream`] builds a stream-backed cell that holds a
//!   default value while unobserved; gaining its first subscriber starts the
//!   source in a demand-managed child job, and losing the last one ends it
//!   and reverts the cell to the default.

use std::{cell::RefCell, rc::Rc};

use super::{core::{connect_on, Sink, Stream},
            inlet::Inlet};
use crate::{job::context::{owner_job, push_frame, Frame},
            signal::{api::make_compare,
                     cell::{AnyValue, CellCore, CellKind, DemandHooks},
                     graph, rule, Cached, RecalcTrigger, Value},
            Job};

impl<T: Clone + PartialEq + 'static> Value<T> {
    /// A stream of this cell's distinct values (starting with the current
    /// one at connect time).
    #[must_use]
    pub fn to_stream(&self) -> Stream<T> {
        cell_stream(self.cell().clone())
    }
}

impl<T: Clone + PartialEq + 'static> Cached<T> {
    /// A stream of this cell's distinct values (starting with the current
    /// one at connect time).
    #[must_use]
    pub fn to_stream(&self) -> Stream<T> {
        cell_stream(self.cell().clone())
    }
}

fn cell_stream<T: Clone + PartialEq + 'static>(cell: Rc<CellCore>) -> Stream<T> {
    Stream::new(move |sink, conn, inlet| {
        observe_cell_into(cell.clone(), sink, conn, inlet);
        Ok(())
    })
}

fn observe_cell_into<T: Clone + PartialEq + 'static>(
    cell: Rc<CellCore>,
    sink: Sink<T>,
    conn: &Job<()>,
    inlet: &Inlet,
) {
    let trigger = RecalcTrigger::new();
    let last_sent: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
    let conn_ref = conn.to_ref();
    let inlet = inlet.clone();

    let body = move || -> miette::Result<()> {
        // Re-run when the inlet resumes, not only when the cell changes.
        trigger.subscribe()?;
        let value = graph::read_cell(&cell).and_then(downcast_value::<T>)?;
        if !inlet.is_ready() {
            if inlet.is_open() {
                let trigger = trigger.clone();
                inlet.on_ready(
                    move || {
                        let _ = trigger.trigger();
                        Ok(())
                    },
                    &conn_ref,
                );
            }
            return Ok(());
        }
        let duplicate = last_sent.borrow().as_ref() == Some(&value);
        if !duplicate {
            sink.send(value.clone())?;
            *last_sent.borrow_mut() = Some(value);
        }
        Ok(())
    };

    // The rule is owned by the conduit: it stops when the conduit ends.
    let _guard = push_frame(Frame::for_job(conn.to_ref()));
    let _handle = rule(body);
}

/// Wrap a push source as a cell: `initial` while unobserved, streaming values
/// while observed. Demand changes are evaluated on the demand-change queue,
/// so subscribe/unsubscribe churn within one tick coalesces.
pub fn from_stream<T: Clone + PartialEq + 'static>(
    initial: T,
    stream: Stream<T>,
) -> Cached<T> {
    let owner = owner_job();
    let cell = CellCore::new(CellKind::StreamBacked);

    let stream_for_start = stream.clone();
    let start = Box::new(move |cell: &Rc<CellCore>| {
        let maybe_owner = cell.inner.borrow().owner.clone();
        let Some(owner) = maybe_owner else { return };
        let source_job = owner.start_empty::<()>();
        let weak_cell = Rc::downgrade(cell);
        let into_cell = Sink::new(move |value: T| match weak_cell.upgrade() {
            Some(cell) => graph::write_cell(&cell, Rc::new(value) as AnyValue),
            None => Ok(()),
        });
        connect_on(&source_job.to_ref(), &stream_for_start, into_cell, None);
        cell.inner.borrow_mut().rule_job = Some(source_job);
    });

    let initial_for_stop = initial.clone();
    let stop = Box::new(move |cell: &Rc<CellCore>| {
        let source_job = cell.inner.borrow_mut().rule_job.take();
        if let Some(job) = source_job {
            job.end();
        }
        // Revert to the default value when demand drops to zero.
        let _ = graph::write_cell(cell, Rc::new(initial_for_stop.clone()) as AnyValue);
    });

    {
        let mut inner = cell.inner.borrow_mut();
        inner.value = Some(Ok(Rc::new(initial) as AnyValue));
        inner.last_changed = graph::now();
        inner.compare = Some(make_compare::<T>());
        inner.owner = Some(owner);
        inner.demand = Some(DemandHooks { start, stop });
    }

    Cached::from_cell(cell)
}

fn downcast_value<T: Clone + 'static>(value: AnyValue) -> miette::Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| miette::miette!("cell value has an unexpected type"))
}
