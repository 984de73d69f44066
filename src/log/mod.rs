//! Paginated, enriched reads of append-only logs.

/// Page and entry types.
pub mod page;
/// Forward pagination with batched display-name lookup.
pub mod reader;
