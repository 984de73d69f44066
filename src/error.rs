//! Error taxonomy shared by the gateway, executor, reconciler and log reader.

use thiserror::Error;

use crate::types::{EntityId, ResourceName};

/// Failure reported by a [`crate::gateway::RemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Network or server-side failure; the call may succeed if repeated.
    #[error("remote store unavailable: {0}")]
    Transient(String),
    /// The mutation target does not exist remotely.
    #[error("{resource} row {id} not found")]
    NotFound {
        /// Resource that was addressed.
        resource: ResourceName,
        /// Missing row id.
        id: String,
    },
    /// The store refused the write (constraint, permission, malformed payload).
    #[error("remote store rejected the write: {0}")]
    Rejected(String),
    /// The gateway or subscription stream has been closed.
    #[error("gateway closed")]
    Closed,
}

/// Row failed schema narrowing or a write failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// Row is not a JSON object.
    #[error("row is not an object")]
    NotAnObject,
    /// Row carries no usable id.
    #[error("row has no valid `{0}` field")]
    MissingId(String),
    /// Required field absent or null.
    #[error("required field `{0}` is missing")]
    MissingField(String),
    /// Field not declared by the resource.
    #[error("unknown field `{0}`")]
    UnknownField(String),
    /// Value does not match the declared kind.
    #[error("field `{field}` expects {expected}")]
    WrongType {
        /// Offending field.
        field: String,
        /// Human-readable kind name.
        expected: &'static str,
    },
}

/// Failure surfaced by resource operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Rejected before any optimistic write.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Target entity is absent locally or remotely.
    #[error("{resource} entity {id} not found")]
    NotFound {
        /// Resource addressed.
        resource: ResourceName,
        /// Missing entity.
        id: EntityId,
    },
    /// Remote store failure; the optimistic write was rolled back.
    #[error(transparent)]
    Store(GatewayError),
    /// A newer request replaced this one before it completed.
    #[error("superseded by a newer request")]
    Superseded,
    /// The owning runtime is gone.
    #[error("resource runtime closed")]
    ChannelClosed,
}

impl From<SchemaError> for EngineError {
    fn from(value: SchemaError) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<GatewayError> for EngineError {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::NotFound { resource, id } => Self::NotFound {
                resource,
                id: EntityId::Server(id),
            },
            other => Self::Store(other),
        }
    }
}

/// Invalid [`crate::config::EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config text could not be parsed.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is outside its accepted range.
    #[error("invalid config value `{field}`: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },
}
