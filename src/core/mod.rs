//! Single-owner resource cache and optimistic mutation executor.

/// Ordered, id-unique entity cache.
pub mod cache;
/// Optimistic write, commit and rollback.
pub mod executor;
