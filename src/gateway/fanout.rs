//! Subscriber registry shared by the reference gateways.

use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{error::GatewayError, types::SubscriptionId};

use super::{ChangeEvent, EventScope, StreamItem, Subscription};

struct Subscriber {
    resource: String,
    scope: EventScope,
    tx: mpsc::UnboundedSender<StreamItem>,
}

/// Delivers change events to open subscriptions.
#[derive(Default)]
pub struct SubscriberSet {
    subs: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
}

impl SubscriberSet {
    pub fn add(&self, resource: &str, scope: &EventScope) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(
            id,
            Subscriber {
                resource: resource.to_string(),
                scope: scope.clone(),
                tx,
            },
        );
        debug!(subscription = id, resource, ?scope, "subscription opened");
        Subscription { id, events: rx }
    }

    /// Drops the sender so the stream ends.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(subscription = id, "subscription closed");
        }
        removed
    }

    /// Sends `event` to every matching subscription; returns the count.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let subs = self.lock();
        let mut delivered = 0;
        for (id, sub) in subs.iter() {
            if sub.resource != event.resource || sub.scope.matches_event(event) == Some(false) {
                continue;
            }
            if sub.tx.send(Ok(event.clone())).is_ok() {
                delivered += 1;
            } else {
                trace!(subscription = id, "receiver gone");
            }
        }
        delivered
    }

    /// Pushes a transport error to every subscription of `resource` and
    /// closes them.
    pub fn fail(&self, resource: &str, err: GatewayError) -> usize {
        let mut subs = self.lock();
        let ids: Vec<SubscriptionId> = subs
            .iter()
            .filter(|(_, s)| s.resource == resource)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(sub) = subs.remove(id) {
                let _ = sub.tx.send(Err(err.clone()));
            }
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, Subscriber>> {
        self.subs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
