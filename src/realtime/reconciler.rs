use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    core::{cache::ResourceCache, executor::MutationExecutor},
    error::GatewayError,
    gateway::{ChangeEvent, ChangeKind, EventScope, SubscriptionGuard},
    schema::ResourceSchema,
    types::{EntityId, Generation},
};

/// Link state of a realtime subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Subscription requested, not yet established.
    Connecting,
    /// Events are flowing.
    Connected,
    /// Torn down or never subscribed.
    Disconnected,
    /// Transport failed; no subscription held.
    Error,
}

/// Effect of one pushed event on the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New entity placed at its order position.
    Inserted(EntityId),
    /// Pushed fields overwrote local values.
    Updated(EntityId),
    /// Entity removed.
    Deleted(EntityId),
    /// Out of scope, unknown, or malformed.
    Ignored,
}

/// Merges pushed changes for one scope into a resource cache.
///
/// Owns at most one subscription at a time. Every scope change or teardown
/// releases the held subscription before anything new is requested, and
/// bumps the generation so results of older requests can be recognised and
/// discarded.
#[derive(Debug)]
pub struct Reconciler {
    schema: Arc<ResourceSchema>,
    scope: Option<EventScope>,
    state: ConnectionState,
    generation: Generation,
    guard: Option<SubscriptionGuard>,
    last_error: Option<GatewayError>,
}

impl Reconciler {
    pub fn new(schema: Arc<ResourceSchema>) -> Self {
        Self {
            schema,
            scope: None,
            state: ConnectionState::Disconnected,
            generation: 0,
            guard: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn scope(&self) -> Option<&EventScope> {
        self.scope.as_ref()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn last_error(&self) -> Option<&GatewayError> {
        self.last_error.as_ref()
    }

    /// Id of the subscription currently held.
    pub fn subscription(&self) -> Option<u64> {
        self.guard.as_ref().map(SubscriptionGuard::id)
    }

    /// Switches to a new key. The old subscription is released first; for
    /// `Some` scope the caller must subscribe and report back with the
    /// returned generation.
    pub fn retarget(&mut self, scope: Option<EventScope>) -> Option<Generation> {
        self.teardown();
        self.scope = scope;
        self.scope.as_ref()?;
        self.transition(ConnectionState::Connecting);
        Some(self.generation)
    }

    /// Installs an established subscription. A stale one is released at
    /// once and `false` returned.
    pub fn attach(&mut self, generation: Generation, guard: SubscriptionGuard) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(resource = %self.schema.name, generation, current = self.generation, "discarding stale subscription");
            return false;
        }
        self.guard = Some(guard);
        self.last_error = None;
        self.transition(ConnectionState::Connected);
        true
    }

    /// Records a subscribe or transport failure for `generation`.
    pub fn fail(&mut self, generation: Generation, err: GatewayError) -> bool {
        if generation != self.generation {
            return false;
        }
        warn!(resource = %self.schema.name, generation, error = %err, "realtime link failed");
        self.guard = None;
        self.last_error = Some(err);
        self.transition(ConnectionState::Error);
        true
    }

    /// Releases the subscription and invalidates outstanding requests.
    pub fn teardown(&mut self) {
        self.guard = None;
        self.generation += 1;
        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// Applies one pushed event; last arrival wins.
    pub fn merge(
        &self,
        cache: &mut ResourceCache,
        executor: &mut MutationExecutor,
        event: &ChangeEvent,
    ) -> MergeOutcome {
        if event.resource != self.schema.name || !self.in_scope(cache, event) {
            return MergeOutcome::Ignored;
        }

        match event.kind {
            ChangeKind::Delete => {
                executor.note_remote_delete(&event.id);
                match cache.remove(&event.id) {
                    Some(_) => MergeOutcome::Deleted(event.id.clone()),
                    None => MergeOutcome::Ignored,
                }
            }
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(row) = event.row.as_ref() else {
                    warn!(resource = %self.schema.name, id = %event.id, "push without row dropped");
                    return MergeOutcome::Ignored;
                };
                if cache.contains(&event.id) {
                    match self.schema.narrow_patch(row) {
                        Ok(patch) => {
                            executor.note_push(&event.id, patch.fields());
                            cache.apply(&event.id, &patch);
                            MergeOutcome::Updated(event.id.clone())
                        }
                        Err(err) => {
                            warn!(resource = %self.schema.name, id = %event.id, error = %err, "malformed push dropped");
                            MergeOutcome::Ignored
                        }
                    }
                } else {
                    match self.schema.ingest(row) {
                        Ok(entity) => {
                            let id = entity.id.clone();
                            cache.insert(entity);
                            MergeOutcome::Inserted(id)
                        }
                        Err(err) => {
                            warn!(resource = %self.schema.name, id = %event.id, error = %err, "malformed push dropped");
                            MergeOutcome::Ignored
                        }
                    }
                }
            }
        }
    }

    fn in_scope(&self, cache: &ResourceCache, event: &ChangeEvent) -> bool {
        let Some(scope) = &self.scope else {
            return false;
        };
        match scope.matches_event(event) {
            Some(hit) => hit,
            None => match scope {
                EventScope::FieldEquals { field, value } => cache
                    .get(&event.id)
                    .is_some_and(|e| e.get(field) == Some(value)),
                _ => false,
            },
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        info!(resource = %self.schema.name, from = ?self.state, to = ?next, "realtime state");
        self.state = next;
    }
}
