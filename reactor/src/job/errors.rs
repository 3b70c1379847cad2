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

//! Typed errors for job lifecycle misuse.

/// Errors from job lifecycle operations. Each variant carries a diagnostic
/// code and actionable help text.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum JobError {
    /// `finish` or `fail` was called on a job that already settled.
    #[error("job already ended")]
    #[diagnostic(
        code(r3bl_reactor::job::already_ended),
        help(
            "A job settles exactly once. Check `is_ended()` before settling, \
             or use `end()` which is an idempotent no-op after settlement."
        )
    )]
    AlreadyEnded,

    /// An operation that needs an ambient job ran outside any job frame.
    #[error("no job is active on the current context stack")]
    #[diagnostic(
        code(r3bl_reactor::job::no_current_job),
        help(
            "Call this from inside a job (a `start`ed future, a rule body, or \
             a cleanup callback), or use `root_job()` explicitly."
        )
    )]
    NoCurrentJob,
}
