use hashbrown::HashMap;
use tracing::warn;

use crate::{
    entity::{Entity, FieldPatch},
    schema::{Direction, OrderBy},
    types::{EntityId, Epoch},
};

/// Ordered, id-unique collection of one resource's entities.
///
/// Writes are only made by the executor and the reconciler of the single
/// owner; reads observe every write as soon as the call returns.
#[derive(Debug, Clone)]
pub struct ResourceCache {
    order_by: OrderBy,
    entities: Vec<Entity>,
    pos: HashMap<EntityId, usize>,
    epoch: Epoch,
}

impl ResourceCache {
    pub fn new(order_by: OrderBy) -> Self {
        Self {
            order_by,
            entities: Vec::new(),
            pos: HashMap::new(),
            epoch: 0,
        }
    }

    /// Replaces the whole cache with a freshly fetched list.
    ///
    /// The list is stable-sorted by the resource key so server order wins on
    /// ties; duplicate ids keep their first occurrence.
    pub fn load(&mut self, fetched: Vec<Entity>) {
        let mut seen = HashMap::with_capacity(fetched.len());
        let mut entities = Vec::with_capacity(fetched.len());
        for entity in fetched {
            if seen.insert(entity.id.clone(), ()).is_some() {
                warn!(id = %entity.id, "duplicate id in fetched rows; keeping first");
                continue;
            }
            entities.push(entity);
        }
        entities.sort_by(|a, b| self.order_by.compare(a, b));
        self.entities = entities;
        self.reindex();
        self.epoch += 1;
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.pos.get(id).map(|idx| &self.entities[*idx])
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.pos.contains_key(id)
    }

    pub fn index_of(&self, id: &EntityId) -> Option<usize> {
        self.pos.get(id).copied()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Load generation; bumped by every [`Self::load`].
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn order_by(&self) -> &OrderBy {
        &self.order_by
    }

    /// Full copy used for equality checks and diagnostics.
    pub fn snapshot(&self) -> Vec<Entity> {
        self.entities.clone()
    }

    /// Patches one entity in place; positions are untouched.
    pub fn apply(&mut self, id: &EntityId, patch: &FieldPatch) -> bool {
        match self.pos.get(id) {
            Some(idx) => {
                patch.apply_to(&mut self.entities[*idx]);
                true
            }
            None => false,
        }
    }

    /// Patches every entity matching `pred`; returns how many matched.
    pub fn apply_where(&mut self, pred: impl Fn(&Entity) -> bool, patch: &FieldPatch) -> usize {
        let mut n = 0;
        for entity in self.entities.iter_mut().filter(|e| pred(e)) {
            patch.apply_to(entity);
            n += 1;
        }
        n
    }

    /// Inserts at the entity's order-key position.
    ///
    /// Returns `None` without change if the id is already present.
    pub fn insert(&mut self, entity: Entity) -> Option<usize> {
        if self.contains(&entity.id) {
            return None;
        }
        let idx = self.insertion_index(&entity);
        self.insert_at(entity, idx)
    }

    /// Inserts at `index` (clamped to the end).
    pub fn insert_at(&mut self, entity: Entity, index: usize) -> Option<usize> {
        if self.contains(&entity.id) {
            return None;
        }
        let idx = index.min(self.entities.len());
        self.entities.insert(idx, entity);
        self.reindex_from(idx);
        Some(idx)
    }

    /// Removes an entity, returning it with the index it held.
    pub fn remove(&mut self, id: &EntityId) -> Option<(Entity, usize)> {
        let idx = self.pos.remove(id)?;
        let entity = self.entities.remove(idx);
        self.reindex_from(idx);
        Some((entity, idx))
    }

    /// Swaps an entity's id (temporary id to server id) in place.
    pub fn rekey(&mut self, from: &EntityId, to: EntityId) -> bool {
        if self.contains(&to) {
            return false;
        }
        let Some(idx) = self.pos.remove(from) else {
            return false;
        };
        self.entities[idx].id = to.clone();
        self.pos.insert(to, idx);
        true
    }

    /// Puts listed ids first in the given order; the rest keep their
    /// relative order after them.
    pub fn arrange(&mut self, order: &[EntityId]) {
        let mut taken: Vec<Option<Entity>> = self.entities.drain(..).map(Some).collect();
        let mut next = Vec::with_capacity(taken.len());
        for id in order {
            if let Some(idx) = self.pos.get(id) {
                if let Some(entity) = taken[*idx].take() {
                    next.push(entity);
                }
            }
        }
        next.extend(taken.into_iter().flatten());
        self.entities = next;
        self.reindex();
    }

    /// Re-sorts by the order key, keeping current order on ties.
    pub fn sort_by_order(&mut self) {
        let order_by = self.order_by.clone();
        self.entities.sort_by(|a, b| order_by.compare(a, b));
        self.reindex();
    }

    fn insertion_index(&self, entity: &Entity) -> usize {
        let missing = entity.get(&self.order_by.field).is_none_or(|v| v.is_null());
        if missing {
            return match self.order_by.direction {
                Direction::Asc => self.entities.len(),
                Direction::Desc => 0,
            };
        }
        self.entities
            .partition_point(|e| self.order_by.compare(e, entity).is_le())
    }

    fn reindex(&mut self) {
        self.pos.clear();
        self.reindex_from(0);
    }

    fn reindex_from(&mut self, start: usize) {
        for (idx, entity) in self.entities.iter().enumerate().skip(start) {
            self.pos.insert(entity.id.clone(), idx);
        }
    }
}
