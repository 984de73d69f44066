use serde::{Deserialize, Serialize};

use crate::{
    entity::Entity,
    error::EngineError,
    gateway::ChangeKind,
    op::MutationKind,
    realtime::reconciler::ConnectionState,
    types::{EntityId, MutationSeq, ResourceName},
};

/// Severity of a user-visible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoticeLevel {
    Success,
    Error,
}

/// Short message for the UI to surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Observable state of one resource runtime, republished after every
/// command, settlement and push.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceView {
    pub resource: ResourceName,
    /// Cache contents in display order.
    pub entities: Vec<Entity>,
    /// A load is outstanding.
    pub loading: bool,
    /// At least one mutation awaits its remote outcome.
    pub saving: bool,
    /// Failure of the most recent load.
    pub error: Option<EngineError>,
    pub connection: ConnectionState,
    pub last_notice: Option<Notice>,
}

impl ResourceView {
    pub(crate) fn empty(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            entities: Vec::new(),
            loading: false,
            saving: false,
            error: None,
            connection: ConnectionState::Disconnected,
            last_notice: None,
        }
    }

    /// Entity with `id`, if present.
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| &e.id == id)
    }
}

/// Domain events broadcast by a resource runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    /// Cache replaced from the store.
    Loaded { count: usize },
    /// A create was confirmed under its server id.
    Created { id: EntityId },
    /// An update or toggle was confirmed.
    Updated { id: EntityId },
    /// A delete was confirmed.
    Deleted { id: EntityId },
    /// A reorder was confirmed.
    Reordered,
    /// A mutation failed and its optimistic write was undone.
    RolledBack {
        seq: MutationSeq,
        kind: MutationKind,
        error: EngineError,
    },
    /// A pushed change was merged.
    Pushed { id: EntityId, kind: ChangeKind },
    ConnectionChanged { state: ConnectionState },
    Notice(Notice),
}
