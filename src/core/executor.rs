use std::{collections::BTreeMap, sync::Arc};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    entity::{Entity, FieldPatch},
    error::{EngineError, GatewayError},
    op::{
        FieldSnapshot, InFlight, MutationIntent, MutationKind, OptimisticSnapshot,
        PendingMutation, RemoteOp, RemoteWrite, Target,
    },
    schema::{FieldKind, ResourceSchema},
    types::{EntityId, MutationSeq, Row},
};

use super::cache::ResourceCache;

/// Outcome of settling one in-flight mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Remote write succeeded; optimistic state stands.
    Committed {
        /// Settled mutation.
        seq: MutationSeq,
        /// Kind of mutation.
        kind: MutationKind,
        /// Entity after commit, when one remains.
        entity: Option<Entity>,
    },
    /// Remote write failed; optimistic state was undone.
    RolledBack {
        /// Settled mutation.
        seq: MutationSeq,
        /// Kind of mutation.
        kind: MutationKind,
        /// Reason surfaced to the user.
        error: EngineError,
    },
    /// No in-flight mutation with this sequence.
    Unknown {
        /// Requested sequence.
        seq: MutationSeq,
    },
}

/// Applies optimistic writes and settles them against remote outcomes.
///
/// Each `begin_*` validates first, so a rejected intent never touches the
/// cache. Each in-flight mutation keeps its own [`OptimisticSnapshot`];
/// rollback restores only what that mutation still owns.
#[derive(Debug)]
pub struct MutationExecutor {
    schema: Arc<ResourceSchema>,
    in_flight: BTreeMap<MutationSeq, InFlight>,
    next_seq: MutationSeq,
    next_local: u64,
}

impl MutationExecutor {
    pub fn new(schema: Arc<ResourceSchema>) -> Self {
        Self {
            schema,
            in_flight: BTreeMap::new(),
            next_seq: 1,
            next_local: 1,
        }
    }

    pub fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    /// Number of mutations awaiting settlement.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, seq: MutationSeq) -> bool {
        self.in_flight.contains_key(&seq)
    }

    pub fn begin_create(
        &mut self,
        cache: &mut ResourceCache,
        payload: Row,
    ) -> Result<PendingMutation, EngineError> {
        self.schema.validate_create(&payload)?;

        let mut payload = payload;
        if self.schema.is_sortable() {
            let field = &self.schema.order_by.field;
            if payload.get(field).is_none_or(Value::is_null) {
                payload.insert(field.clone(), json!(next_sort_index(cache, field)));
            }
        }

        let local_id = EntityId::Local(self.next_local);
        self.next_local += 1;

        let mut entity = Entity::new(local_id.clone());
        for spec in &self.schema.fields {
            let value = payload.get(&spec.name).cloned().unwrap_or(Value::Null);
            entity.fields.insert(spec.name.clone(), value);
        }
        cache.insert(entity.clone());

        let write = RemoteWrite {
            resource: self.schema.name.clone(),
            op: RemoteOp::Insert,
            payload: payload.clone(),
            match_id: None,
        };
        let intent = MutationIntent {
            target: Target::New,
            kind: MutationKind::Create,
            deltas: FieldPatch::from_row(&payload),
        };
        Ok(self.track(
            cache,
            intent,
            OptimisticSnapshot::Created { local_id },
            vec![write],
            Some(entity),
        ))
    }

    pub fn begin_update(
        &mut self,
        cache: &mut ResourceCache,
        id: &EntityId,
        patch: FieldPatch,
    ) -> Result<PendingMutation, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("update carries no fields".to_string()));
        }
        self.schema.validate_patch(&patch)?;
        self.begin_fields(cache, id, patch, MutationKind::Update)
    }

    /// Flips a boolean field, reading its value from the cache at call time.
    pub fn begin_toggle(
        &mut self,
        cache: &mut ResourceCache,
        id: &EntityId,
        field: &str,
    ) -> Result<PendingMutation, EngineError> {
        match self.schema.spec(field) {
            Some(spec) if spec.kind == FieldKind::Bool => {}
            Some(_) => {
                return Err(EngineError::Validation(format!("field `{field}` is not a boolean")));
            }
            None => return Err(EngineError::Validation(format!("unknown field `{field}`"))),
        }
        let current = self.target(cache, id)?.flag(field);
        let patch = FieldPatch::one(field, Value::Bool(!current));
        self.begin_fields(cache, id, patch, MutationKind::Toggle)
    }

    pub fn begin_delete(
        &mut self,
        cache: &mut ResourceCache,
        id: &EntityId,
    ) -> Result<PendingMutation, EngineError> {
        let match_id = self.server_id(cache, id)?;
        let Some((entity, index)) = cache.remove(id) else {
            return Err(self.not_found(id));
        };

        let write = RemoteWrite {
            resource: self.schema.name.clone(),
            op: RemoteOp::Delete,
            payload: Row::new(),
            match_id: Some(match_id),
        };
        let intent = MutationIntent {
            target: Target::Entity(id.clone()),
            kind: MutationKind::Delete,
            deltas: FieldPatch::default(),
        };
        let snapshot = OptimisticSnapshot::Deleted {
            entity,
            index,
            confirmed_gone: false,
        };
        Ok(self.track(cache, intent, snapshot, vec![write], None))
    }

    /// Assigns sort indices `0..n` following `order`.
    ///
    /// `order` must list every cached id exactly once.
    pub fn begin_reorder(
        &mut self,
        cache: &mut ResourceCache,
        order: &[EntityId],
    ) -> Result<PendingMutation, EngineError> {
        if !self.schema.is_sortable() {
            return Err(EngineError::Validation(format!(
                "{} has no explicit sort order",
                self.schema.name
            )));
        }
        if order.len() != cache.len() {
            return Err(EngineError::Validation(
                "reorder must list every entity exactly once".to_string(),
            ));
        }
        let mut seen = hashbrown::HashSet::with_capacity(order.len());
        for id in order {
            self.server_id(cache, id)?;
            if !seen.insert(id) {
                return Err(EngineError::Validation(format!("entity {id} listed twice")));
            }
        }

        let field = self.schema.order_by.field.clone();
        let prev_order = cache.ids();
        let mut snapshots = Vec::new();
        let mut writes = Vec::new();
        for (idx, id) in order.iter().enumerate() {
            let value = json!(idx);
            let Some(entity) = cache.get(id) else {
                continue;
            };
            if entity.get(&field) == Some(&value) {
                continue;
            }
            let patch = FieldPatch::one(&field, value);
            let prev = patch.capture_inverse_for(entity);
            cache.apply(id, &patch);
            writes.push(RemoteWrite {
                resource: self.schema.name.clone(),
                op: RemoteOp::Update,
                payload: patch.to_row(),
                match_id: id.as_server().map(str::to_string),
            });
            snapshots.push(FieldSnapshot {
                id: id.clone(),
                prev,
                written: patch,
            });
        }
        cache.arrange(order);

        let intent = MutationIntent {
            target: Target::All,
            kind: MutationKind::Reorder,
            deltas: FieldPatch::default(),
        };
        let snapshot = OptimisticSnapshot::Reordered {
            fields: snapshots,
            prev_order,
        };
        Ok(self.track(cache, intent, snapshot, writes, None))
    }

    /// Applies the remote outcome of `seq`: commit on success, rollback on
    /// failure. Mutations begun before the last reload leave the cache alone.
    pub fn settle(
        &mut self,
        cache: &mut ResourceCache,
        seq: MutationSeq,
        outcome: Result<Vec<Option<Row>>, GatewayError>,
    ) -> Settlement {
        let Some(flight) = self.in_flight.remove(&seq) else {
            return Settlement::Unknown { seq };
        };
        let kind = flight.kind;
        let current = flight.epoch == cache.epoch();

        match outcome {
            Ok(rows) => {
                let entity = self.commit(cache, flight, rows, current);
                debug!(resource = %self.schema.name, seq, ?kind, "mutation committed");
                Settlement::Committed { seq, kind, entity }
            }
            Err(err) => {
                if current {
                    self.rollback(cache, flight);
                }
                warn!(resource = %self.schema.name, seq, ?kind, error = %err, "mutation rolled back");
                Settlement::RolledBack {
                    seq,
                    kind,
                    error: EngineError::from(err),
                }
            }
        }
    }

    /// Records that a push overwrote `fields` of `id`; in-flight mutations
    /// stop owning them.
    pub fn note_push<'a>(&mut self, id: &EntityId, fields: impl IntoIterator<Item = &'a String>) {
        let fields: Vec<&String> = fields.into_iter().collect();
        for flight in self.in_flight.values_mut() {
            for fs in flight.snapshot.field_snapshots_mut() {
                if &fs.id == id {
                    for f in &fields {
                        fs.prev.remove(f);
                    }
                }
            }
        }
    }

    /// Records that a push confirmed `id` deleted remotely.
    pub fn note_remote_delete(&mut self, id: &EntityId) {
        for flight in self.in_flight.values_mut() {
            if let OptimisticSnapshot::Deleted {
                entity,
                confirmed_gone,
                ..
            } = &mut flight.snapshot
            {
                if &entity.id == id {
                    *confirmed_gone = true;
                }
            }
        }
    }

    fn begin_fields(
        &mut self,
        cache: &mut ResourceCache,
        id: &EntityId,
        patch: FieldPatch,
        kind: MutationKind,
    ) -> Result<PendingMutation, EngineError> {
        let match_id = self.server_id(cache, id)?;
        let entity = self.target(cache, id)?;
        let prev = patch.capture_inverse_for(entity);
        cache.apply(id, &patch);

        let write = RemoteWrite {
            resource: self.schema.name.clone(),
            op: RemoteOp::Update,
            payload: patch.to_row(),
            match_id: Some(match_id),
        };
        let intent = MutationIntent {
            target: Target::Entity(id.clone()),
            kind,
            deltas: patch.clone(),
        };
        let snapshot = OptimisticSnapshot::Fields(FieldSnapshot {
            id: id.clone(),
            prev,
            written: patch,
        });
        let preview = cache.get(id).cloned();
        Ok(self.track(cache, intent, snapshot, vec![write], preview))
    }

    fn track(
        &mut self,
        cache: &ResourceCache,
        intent: MutationIntent,
        snapshot: OptimisticSnapshot,
        writes: Vec<RemoteWrite>,
        preview: Option<Entity>,
    ) -> PendingMutation {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.insert(
            seq,
            InFlight {
                seq,
                kind: intent.kind,
                epoch: cache.epoch(),
                snapshot,
            },
        );
        debug!(resource = %self.schema.name, seq, kind = ?intent.kind, "optimistic write applied");
        PendingMutation {
            seq,
            intent,
            writes,
            preview,
        }
    }

    fn commit(
        &mut self,
        cache: &mut ResourceCache,
        flight: InFlight,
        rows: Vec<Option<Row>>,
        current: bool,
    ) -> Option<Entity> {
        let seq = flight.seq;
        match flight.snapshot {
            OptimisticSnapshot::Created { local_id } => {
                let row = rows.into_iter().flatten().next();
                let confirmed = match row.as_ref().map(|r| self.schema.ingest(r)) {
                    Some(Ok(entity)) => entity,
                    Some(Err(err)) => {
                        warn!(resource = %self.schema.name, seq, error = %err, "create returned an unusable row");
                        return cache.get(&local_id).cloned();
                    }
                    None => return cache.get(&local_id).cloned(),
                };
                if !current {
                    return Some(confirmed);
                }
                if cache.contains(&confirmed.id) {
                    // The insert echo won the race; it already carries the row.
                    cache.remove(&local_id);
                } else if cache.rekey(&local_id, confirmed.id.clone()) {
                    let mut generated = FieldPatch::default();
                    for (field, value) in &confirmed.fields {
                        generated.set(field, value.clone());
                    }
                    cache.apply(&confirmed.id, &generated);
                } else {
                    cache.insert(confirmed.clone());
                }
                cache.get(&confirmed.id).cloned()
            }
            OptimisticSnapshot::Fields(fs) => {
                self.release_fields(seq, &fs);
                if current { cache.get(&fs.id).cloned() } else { None }
            }
            OptimisticSnapshot::Reordered { fields, .. } => {
                for fs in &fields {
                    self.release_fields(seq, fs);
                }
                None
            }
            OptimisticSnapshot::Deleted { .. } => None,
        }
    }

    /// Hands the fields `fs` wrote over to the mutations around it. The
    /// optimistic values stay in the cache and the reply row is ignored.
    fn release_fields(&mut self, seq: MutationSeq, fs: &FieldSnapshot) {
        self.supersede_earlier(seq, fs);
        for (field, value) in fs.written.iter() {
            if !fs.prev.touches(field) {
                continue;
            }
            let heir = self
                .in_flight
                .range_mut(seq + 1..)
                .map(|(_, f)| f)
                .find_map(|f| f.snapshot.owner_of_mut(&fs.id, field));
            if let Some(next) = heir {
                next.prev.set(field, value.clone());
            }
        }
    }

    /// Earlier mutations on the same fields were overwritten server-side by
    /// this commit.
    fn supersede_earlier(&mut self, seq: MutationSeq, committed: &FieldSnapshot) {
        for flight in self.in_flight.range_mut(..seq).map(|(_, f)| f) {
            for fs in flight.snapshot.field_snapshots_mut() {
                if fs.id == committed.id {
                    for field in committed.written.fields() {
                        fs.prev.remove(field);
                    }
                }
            }
        }
    }

    fn rollback(&mut self, cache: &mut ResourceCache, flight: InFlight) {
        let seq = flight.seq;
        match flight.snapshot {
            OptimisticSnapshot::Created { local_id } => {
                cache.remove(&local_id);
            }
            OptimisticSnapshot::Fields(fs) => {
                self.rollback_fields(cache, seq, fs);
            }
            OptimisticSnapshot::Deleted {
                entity,
                index,
                confirmed_gone,
            } => {
                if !confirmed_gone && !cache.contains(&entity.id) {
                    cache.insert_at(entity, index);
                }
            }
            OptimisticSnapshot::Reordered { fields, prev_order } => {
                let mut intact = true;
                for fs in fields {
                    intact &= self.rollback_fields(cache, seq, fs);
                }
                if intact {
                    cache.arrange(&prev_order);
                } else {
                    cache.sort_by_order();
                }
            }
        }
    }

    /// Restores the fields `fs` still owns. A later in-flight mutation on
    /// the same field inherits the prior value instead. Returns true when
    /// every written field was restored to the cache.
    fn rollback_fields(&mut self, cache: &mut ResourceCache, seq: MutationSeq, fs: FieldSnapshot) -> bool {
        let mut intact = fs.prev.len() == fs.written.len();
        let mut restore = FieldPatch::default();

        for (field, prev) in fs.prev.iter() {
            let heir = self
                .in_flight
                .range_mut(seq + 1..)
                .map(|(_, f)| f)
                .find_map(|f| f.snapshot.owner_of_mut(&fs.id, field));
            match heir {
                Some(next) => {
                    next.prev.set(field, prev.clone());
                    intact = false;
                }
                None => restore.set(field, prev.clone()),
            }
        }

        if !restore.is_empty() {
            self.patch_entity(cache, &fs.id, &restore);
        }
        intact
    }

    /// Patches `id` in the cache, or, while it is optimistically deleted,
    /// the copy a failed delete would bring back.
    fn patch_entity(&mut self, cache: &mut ResourceCache, id: &EntityId, patch: &FieldPatch) {
        if cache.apply(id, patch) {
            return;
        }
        for flight in self.in_flight.values_mut() {
            if let OptimisticSnapshot::Deleted { entity, .. } = &mut flight.snapshot {
                if &entity.id == id {
                    patch.apply_to(entity);
                }
            }
        }
    }

    fn target<'c>(&self, cache: &'c ResourceCache, id: &EntityId) -> Result<&'c Entity, EngineError> {
        if id.is_local() {
            return Err(EngineError::Validation(format!("entity {id} is still being created")));
        }
        cache.get(id).ok_or_else(|| self.not_found(id))
    }

    fn server_id(&self, cache: &ResourceCache, id: &EntityId) -> Result<String, EngineError> {
        let entity = self.target(cache, id)?;
        entity
            .id
            .as_server()
            .map(str::to_string)
            .ok_or_else(|| self.not_found(id))
    }

    fn not_found(&self, id: &EntityId) -> EngineError {
        EngineError::NotFound {
            resource: self.schema.name.clone(),
            id: id.clone(),
        }
    }
}

fn next_sort_index(cache: &ResourceCache, field: &str) -> i64 {
    cache
        .entities()
        .iter()
        .filter_map(|e| e.get(field).and_then(Value::as_i64))
        .max()
        .map_or(0, |max| max + 1)
}
