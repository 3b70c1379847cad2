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

//! The discriminated result of a job: a value, an error, or a cancellation.
//!
//! Errors are carried as [`ErrorPayload`]: a shared [`miette::Report`] plus an
//! out-of-band "handled" bit. Marking an error handled (directly via
//! [`ErrorPayload::mark_handled`], or implicitly by an error observer such as
//! [`crate::Job::on_error`] or the future bridge) suppresses the async re-throw
//! at the final escalation hop.

use std::{fmt::Display,
          sync::{atomic::{AtomicBool, Ordering},
                 Arc}};

/// The result of a job. Set exactly once; immutable afterwards.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The job completed with a value.
    Value(T),
    /// The job failed. The payload is shared between every observer of the
    /// error, so any one of them can mark it handled.
    Error(ErrorPayload),
    /// The job was canceled before it settled with a value or an error.
    Cancel,
}

impl<T> Outcome<T> {
    #[must_use]
    pub fn is_value(&self) -> bool { matches!(self, Outcome::Value(_)) }

    #[must_use]
    pub fn is_error(&self) -> bool { matches!(self, Outcome::Error(_)) }

    #[must_use]
    pub fn is_cancel(&self) -> bool { matches!(self, Outcome::Cancel) }

    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&ErrorPayload> {
        match self {
            Outcome::Error(payload) => Some(payload),
            _ => None,
        }
    }

    /// Convert into the [`miette::Result`] an awaiter sees: cancellation
    /// becomes a typed [`CancelError`].
    ///
    /// # Errors
    ///
    /// Returns the carried error report, or [`CancelError`] for a canceled job.
    pub fn into_result(self) -> miette::Result<T> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Error(payload) => Err(payload.to_report()),
            Outcome::Cancel => Err(miette::Report::new(CancelError)),
        }
    }
}

/// A cheaply-cloneable error with a shared "handled" marker.
///
/// Every clone refers to the same underlying report and the same handled bit.
#[derive(Debug, Clone)]
pub struct ErrorPayload {
    report: Arc<miette::Report>,
    handled: Arc<AtomicBool>,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(report: miette::Report) -> Self {
        Self {
            report: Arc::new(report),
            handled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn report(&self) -> &miette::Report { &self.report }

    /// Build a fresh [`miette::Report`] that forwards to the shared one, for
    /// call sites that must return an owned report ([`miette::Report`] is not
    /// `Clone`).
    #[must_use]
    pub fn to_report(&self) -> miette::Report {
        miette::Report::new(SharedError {
            inner: self.report.clone(),
        })
    }

    /// Unwrap into an owned report. When this payload is the sole owner, the
    /// original report comes back (so `downcast_ref` on the caller side sees
    /// the original error type); otherwise a forwarding report is built.
    #[must_use]
    pub fn into_report(self) -> miette::Report {
        match Arc::try_unwrap(self.report) {
            Ok(report) => report,
            Err(shared) => miette::Report::new(SharedError { inner: shared }),
        }
    }

    /// Accept responsibility for this error: the async escalation path will
    /// not re-throw it at the final hop.
    pub fn mark_handled(&self) { self.handled.store(true, Ordering::SeqCst); }

    #[must_use]
    pub fn is_handled(&self) -> bool { self.handled.load(Ordering::SeqCst) }
}

impl From<miette::Report> for ErrorPayload {
    fn from(report: miette::Report) -> Self { Self::new(report) }
}

impl Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.report)
    }
}

/// A report wrapper so one shared error can be handed out as many owned
/// [`miette::Report`]s.
#[derive(Debug, thiserror::Error)]
#[error("{inner}")]
pub struct SharedError {
    inner: Arc<miette::Report>,
}

impl miette::Diagnostic for SharedError {
    fn code<'a>(&'a self) -> Option<Box<dyn Display + 'a>> { self.inner.code() }

    fn severity(&self) -> Option<miette::Severity> { self.inner.severity() }

    fn help<'a>(&'a self) -> Option<Box<dyn Display + 'a>> { self.inner.help() }

    fn url<'a>(&'a self) -> Option<Box<dyn Display + 'a>> { self.inner.url() }
}

/// The typed error awaiters receive when the job they await is canceled
/// instead of settling with a value or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
#[error("job was canceled before it produced a value")]
#[diagnostic(
    code(r3bl_reactor::job::canceled),
    help(
        "The job (or one of its ancestors) was ended. Use `on_cancel` or match \
         on `Outcome::Cancel` if cancellation is an expected exit path."
    )
)]
pub struct CancelError;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_outcome_predicates() {
        let value: Outcome<i32> = Outcome::Value(42);
        let error: Outcome<i32> = Outcome::Error(ErrorPayload::new(miette::miette!("boom")));
        let cancel: Outcome<i32> = Outcome::Cancel;

        assert!(value.is_value());
        assert!(!value.is_error());
        assert!(error.is_error());
        assert!(!error.is_cancel());
        assert!(cancel.is_cancel());
        assert!(!cancel.is_value());

        assert_eq!(value.value(), Some(&42));
        assert!(error.error().is_some());
    }

    #[test]
    fn test_into_result_maps_cancel_to_cancel_error() {
        let cancel: Outcome<i32> = Outcome::Cancel;
        let err = cancel.into_result().unwrap_err();
        assert!(err.downcast_ref::<CancelError>().is_some());
    }

    #[test]
    fn test_handled_bit_is_shared_across_clones() {
        let payload = ErrorPayload::new(miette::miette!("boom"));
        let clone = payload.clone();
        assert!(!clone.is_handled());

        payload.mark_handled();
        assert!(clone.is_handled());
    }

    #[test]
    fn test_to_report_preserves_message() {
        let payload = ErrorPayload::new(miette::miette!("exact message"));
        let report = payload.to_report();
        assert_eq!(format!("{report}"), "exact message");
    }
}
