//! Single-writer resource runtime, observable view and event stream.

/// View, notice and event types published by the runtime.
pub mod events;
/// Handle and command loop implementation.
pub mod handle;
