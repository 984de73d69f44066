//! Shared primitive identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Resource (table-like collection) name, e.g. `"delivery_zones"`.
pub type ResourceName = String;
/// Monotonic sequence number of one optimistic mutation.
pub type MutationSeq = u64;
/// Gateway-issued subscription identifier.
pub type SubscriptionId = u64;
/// Load generation of a resource cache.
pub type Epoch = u64;
/// Subscription key generation of a reconciler.
pub type Generation = u64;

/// Raw row as exchanged with the remote store.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Entity identifier.
///
/// Server ids are opaque strings; numeric ids are carried in their decimal
/// form. `Local` ids exist only between an optimistic create and its
/// confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityId {
    /// Server-assigned identifier.
    Server(String),
    /// Temporary identifier of a pending create.
    Local(u64),
}

impl EntityId {
    /// Returns true while the entity is still waiting for its server id.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Parses an id out of a JSON value (string or integer).
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(Self::Server(s.clone())),
            serde_json::Value::Number(n) => Some(Self::Server(n.to_string())),
            _ => None,
        }
    }

    /// Server id text, if assigned.
    pub fn as_server(&self) -> Option<&str> {
        match self {
            Self::Server(s) => Some(s),
            Self::Local(_) => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(s) => f.write_str(s),
            Self::Local(n) => write!(f, "local:{n}"),
        }
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::Server(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self::Server(value)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self::Server(value.to_string())
    }
}
