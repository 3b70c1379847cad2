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

//! Timer glue. The timer is owned by the suspended future, so ending the job
//! (dropping its future) releases the timer with it; no explicit clear is
//! needed.

use std::time::Duration;

/// Sleep inside a job. Requires a Tokio runtime on the current thread (tests
/// use a paused clock and `tokio::time::advance`).
pub async fn sleep(duration: Duration) { tokio::time::sleep(duration).await; }
