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

//! Tracing setup helpers for binaries, demos, and tests. The library itself
//! only emits events (`tracing::error!` on unhandled root errors,
//! `tracing::warn!` on stopped rules); it never installs a subscriber on its
//! own.

use std::path::Path;

use tracing::Level;

/// Install a compact stderr subscriber at the given level. Safe to call more
/// than once (later calls fail quietly with an error you can ignore in
/// tests).
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn try_initialize_logging(max_level: Level) -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|error| miette::miette!("failed to install tracing subscriber: {error}"))
}

/// Install a subscriber that appends to a daily-rolled file in `dir`.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn try_initialize_file_logging(
    dir: impl AsRef<Path>,
    file_name_prefix: &str,
    max_level: Level,
) -> miette::Result<()> {
    let appender = tracing_appender::rolling::daily(dir, file_name_prefix);
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_writer(appender)
        .with_ansi(false)
        .try_init()
        .map_err(|error| miette::miette!("failed to install tracing subscriber: {error}"))
}
