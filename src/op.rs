//! Mutation intents, remote write descriptions and optimistic snapshots.

use serde::{Deserialize, Serialize};

use crate::{
    entity::{Entity, FieldPatch},
    types::{EntityId, Epoch, MutationSeq, ResourceName, Row},
};

/// Kind of local state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    /// New entity.
    Create,
    /// Sparse field update.
    Update,
    /// Entity removal.
    Delete,
    /// Boolean flip computed from current state.
    Toggle,
    /// New explicit ordering of a sortable resource.
    Reorder,
}

/// Target of a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Entity not yet assigned an id.
    New,
    /// Existing entity.
    Entity(EntityId),
    /// Every entity of the resource.
    All,
}

/// A single requested state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationIntent {
    /// What is changed.
    pub target: Target,
    /// How it is changed.
    pub kind: MutationKind,
    /// Field deltas carried by the intent.
    pub deltas: FieldPatch,
}

/// Remote operation verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteOp {
    /// Insert a row.
    Insert,
    /// Update the row matching `match_id`.
    Update,
    /// Delete the row matching `match_id`.
    Delete,
}

/// One call to [`crate::gateway::RemoteStore::mutate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWrite {
    /// Resource addressed.
    pub resource: ResourceName,
    /// Verb.
    pub op: RemoteOp,
    /// Column values written.
    pub payload: Row,
    /// Server id of the row for update/delete.
    pub match_id: Option<String>,
}

/// Prior and optimistic values of the fields one mutation touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    /// Entity touched.
    pub id: EntityId,
    /// Values before the optimistic write.
    pub prev: FieldPatch,
    /// Values the optimistic write installed.
    pub written: FieldPatch,
}

/// State needed to undo one optimistic write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimisticSnapshot {
    /// Temporary entity inserted by a create.
    Created {
        /// Temporary id.
        local_id: EntityId,
    },
    /// Field values replaced by an update or toggle.
    Fields(FieldSnapshot),
    /// Entity removed by a delete.
    Deleted {
        /// Entity as it was removed.
        entity: Entity,
        /// Index it occupied.
        index: usize,
        /// A push confirmed the delete remotely; rollback must not resurrect it.
        confirmed_gone: bool,
    },
    /// Sort keys rewritten by a reorder.
    Reordered {
        /// Sort-field snapshot per entity whose key changed.
        fields: Vec<FieldSnapshot>,
        /// Order before the reorder.
        prev_order: Vec<EntityId>,
    },
}

impl OptimisticSnapshot {
    /// Field snapshots held by this mutation.
    pub fn field_snapshots_mut(&mut self) -> &mut [FieldSnapshot] {
        match self {
            Self::Fields(fs) => std::slice::from_mut(fs),
            Self::Reordered { fields, .. } => fields.as_mut_slice(),
            Self::Created { .. } | Self::Deleted { .. } => Default::default(),
        }
    }

    /// Field snapshot of `id` that still owns `field`.
    pub fn owner_of_mut(&mut self, id: &EntityId, field: &str) -> Option<&mut FieldSnapshot> {
        self.field_snapshots_mut()
            .iter_mut()
            .find(|fs| &fs.id == id && fs.prev.touches(field))
    }

    /// True when this mutation still owns `field` of `id`.
    pub fn touches(&self, id: &EntityId, field: &str) -> bool {
        match self {
            Self::Fields(fs) => &fs.id == id && fs.prev.touches(field),
            Self::Reordered { fields, .. } => fields
                .iter()
                .any(|fs| &fs.id == id && fs.prev.touches(field)),
            Self::Created { .. } | Self::Deleted { .. } => false,
        }
    }
}

/// Bookkeeping for one mutation between its optimistic write and settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlight {
    /// Sequence number.
    pub seq: MutationSeq,
    /// Kind of mutation.
    pub kind: MutationKind,
    /// Cache epoch at the optimistic write.
    pub epoch: Epoch,
    /// Undo information.
    pub snapshot: OptimisticSnapshot,
}

/// Output of a `begin_*` call: the remote work to perform.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    /// Sequence number to settle with.
    pub seq: MutationSeq,
    /// Intent as applied.
    pub intent: MutationIntent,
    /// Writes to issue, in order.
    pub writes: Vec<RemoteWrite>,
    /// Entity as it looks after the optimistic write, if one remains.
    pub preview: Option<Entity>,
}
