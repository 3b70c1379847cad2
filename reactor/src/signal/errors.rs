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

//! Typed errors for signal graph misuse. All of these surface synchronously
//! at the read or write site that violated the rule.

/// Errors from reads and writes on the signal graph.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum SignalError {
    /// A write would invalidate a cell that was already read (directly or
    /// virtually) in the current timestamp.
    #[error("write conflict: cell was already read in the current timestamp")]
    #[diagnostic(
        code(r3bl_reactor::signal::write_conflict),
        help(
            "A rule may not write a cell after its value was observed in the \
             same sweep. Move the write outside the rule (eg: via `action`), \
             or restructure so the rule does not read what it writes."
        )
    )]
    WriteConflict,

    /// A cell's compute read a cell that is currently running.
    #[error("circular dependency: the cell being read is currently computing")]
    #[diagnostic(
        code(r3bl_reactor::signal::circular_dependency),
        help(
            "A computed cell (or rule) reached itself through its own \
             sources. Break the cycle with `peek` or an intermediate value \
             cell."
        )
    )]
    CircularDependency,

    /// A computed cell attempted a write.
    #[error("side effect forbidden: computed cells may not write")]
    #[diagnostic(
        code(r3bl_reactor::signal::side_effect_forbidden),
        help(
            "Computed cells must be pure. Move the write into a rule, which \
             is the cell kind that exists for side effects."
        )
    )]
    SideEffectForbidden,
}
