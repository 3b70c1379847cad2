// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The stream layer: lazy pausable push sources, conduits bound to jobs, the
//! backpressure inlet, operators, and the bridges to the signal graph.

// Attach sources.
pub mod core;
pub mod inlet;
pub mod operators;
pub mod signal_bridge;
pub mod sources;

// Re-export.
pub use self::core::*;
pub use inlet::*;
pub use signal_bridge::*;
pub use sources::*;
