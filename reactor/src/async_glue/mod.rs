// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Async glue: the suspend protocol, timer sleep, and push-to-pull bridging.
//! Jobs drive any native `Future` directly, so promise adapters are not
//! needed; these helpers cover the seams futures do not reach.

// Attach sources.
pub mod each;
pub mod sleep;
pub mod suspend;

// Re-export.
pub use each::*;
pub use sleep::*;
pub use suspend::*;
