use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::EntityId;

/// How log entries are joined to a display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Column of the log row holding the foreign id.
    pub foreign_field: String,
    /// Resource the id refers to.
    pub lookup_resource: String,
    /// Column of the looked-up row shown to users.
    pub display_field: String,
}

impl Default for JoinSpec {
    fn default() -> Self {
        Self {
            foreign_field: "user_id".to_string(),
            lookup_resource: "users".to_string(),
            display_field: "name".to_string(),
        }
    }
}

/// One log row with its resolved display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: EntityId,
    pub fields: BTreeMap<String, Value>,
    /// Foreign id the join used, if the row had one.
    pub actor_id: Option<String>,
    /// Looked-up name, or the fallback label.
    pub display_name: String,
}

impl LogEntry {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Contiguous slice of the log starting at `offset`. Never changes once
/// fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    offset: usize,
    fetched: usize,
    entries: Vec<LogEntry>,
}

impl LogPage {
    pub(crate) fn new(offset: usize, fetched: usize, entries: Vec<LogEntry>) -> Self {
        Self {
            offset,
            fetched,
            entries,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Rows the store returned for this page, including any skipped as
    /// malformed.
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
