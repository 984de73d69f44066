//! Realtime change reconciliation.

/// Subscription lifecycle and event merging.
pub mod reconciler;
