//! Remote store boundary: query, mutate, subscribe, lookup.

/// Subscriber registry for the reference gateways.
pub mod fanout;
/// In-process gateway with fault injection.
pub mod memory;
/// SQLite-backed gateway.
pub mod sqlite;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    entity::compare_values,
    error::GatewayError,
    op::RemoteWrite,
    schema::{Direction, OrderBy, ResourceSchema},
    types::{EntityId, ResourceName, Row, SubscriptionId},
};

/// Equality filter on one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Column name.
    pub field: String,
    /// Required value.
    pub value: Value,
}

/// Arguments of [`RemoteStore::fetch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchQuery {
    /// Resource to read.
    pub resource: ResourceName,
    /// Conjunction of equality filters.
    pub filters: Vec<Filter>,
    /// Server-side ordering.
    pub order_by: Option<OrderBy>,
    /// Rows to skip.
    pub offset: Option<usize>,
    /// Maximum rows returned.
    pub limit: Option<usize>,
}

impl FetchQuery {
    /// Unfiltered, unordered query over `resource`.
    pub fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            filters: Vec::new(),
            order_by: None,
            offset: None,
            limit: None,
        }
    }

    /// Adds an equality filter.
    pub fn filter(mut self, field: &str, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            value,
        });
        self
    }

    /// Sets the ordering.
    pub fn order(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    /// Sets offset and limit.
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }
}

/// Kind of server-pushed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Row created.
    Insert,
    /// Row modified.
    Update,
    /// Row removed.
    Delete,
}

/// Server-pushed notification for one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Resource the row belongs to.
    pub resource: ResourceName,
    /// What happened.
    pub kind: ChangeKind,
    /// Row id.
    pub id: EntityId,
    /// New row values; for deletes, the old row when the store provides it.
    pub row: Option<Row>,
}

/// Which events a subscription is interested in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventScope {
    /// Every row of the resource.
    All,
    /// One row.
    Entity(EntityId),
    /// Rows whose column equals a value.
    FieldEquals {
        /// Column name.
        field: String,
        /// Value to match.
        value: Value,
    },
}

impl EventScope {
    /// Decides from the event alone; `None` when the event lacks the data
    /// (a delete without its old row under a field scope).
    pub fn matches_event(&self, event: &ChangeEvent) -> Option<bool> {
        match self {
            Self::All => Some(true),
            Self::Entity(id) => Some(&event.id == id),
            Self::FieldEquals { field, value } => event
                .row
                .as_ref()
                .map(|row| row.get(field) == Some(value)),
        }
    }
}

/// Item delivered on a subscription stream.
pub type StreamItem = Result<ChangeEvent, GatewayError>;

/// Open subscription returned by [`RemoteStore::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    /// Id to pass to [`RemoteStore::unsubscribe`].
    pub id: SubscriptionId,
    /// Event stream; ends when the subscription is released.
    pub events: mpsc::UnboundedReceiver<StreamItem>,
}

/// Opaque backing data service.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reads rows.
    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<Row>, GatewayError>;
    /// Applies one write; returns the affected row when the store echoes it.
    async fn mutate(&self, write: &RemoteWrite) -> Result<Option<Row>, GatewayError>;
    /// Opens an event stream for `resource` limited to `scope`.
    async fn subscribe(&self, resource: &str, scope: &EventScope) -> Result<Subscription, GatewayError>;
    /// Releases a subscription; unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
    /// Maps ids to the `display_field` of matching rows; unknown ids are absent.
    async fn batched_lookup(
        &self,
        resource: &str,
        display_field: &str,
        ids: &[String],
    ) -> Result<HashMap<String, String>, GatewayError>;
}

/// Releases its subscription when dropped, on every exit path.
pub struct SubscriptionGuard {
    id: SubscriptionId,
    gateway: Arc<dyn RemoteStore>,
}

impl SubscriptionGuard {
    pub fn new(id: SubscriptionId, gateway: Arc<dyn RemoteStore>) -> Self {
        Self { id, gateway }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard").field("id", &self.id).finish()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        debug!(subscription = self.id, "releasing subscription");
        self.gateway.unsubscribe(self.id);
    }
}

/// Id column per resource for the reference gateways. Resources that were
/// never registered use `id`.
#[derive(Debug, Clone, Default)]
pub struct KeyColumns {
    columns: HashMap<ResourceName, String>,
}

impl KeyColumns {
    /// Records the id column declared by `schema`.
    pub fn register(&mut self, schema: &ResourceSchema) {
        self.columns
            .insert(schema.name.clone(), schema.id_field.clone());
    }

    /// Id column of `resource`.
    pub fn column(&self, resource: &str) -> &str {
        self.columns.get(resource).map_or("id", String::as_str)
    }
}

/// Value of the id column `key` in a raw row.
pub(crate) fn row_id(row: &Row, key: &str) -> Option<String> {
    row.get(key)
        .and_then(EntityId::from_json)
        .and_then(|id| id.as_server().map(str::to_string))
}

/// Filters, orders and paginates rows the way a store would.
pub(crate) fn apply_query(mut rows: Vec<Row>, query: &FetchQuery) -> Vec<Row> {
    rows.retain(|row| {
        query
            .filters
            .iter()
            .all(|f| row.get(&f.field) == Some(&f.value))
    });
    if let Some(order_by) = &query.order_by {
        rows.sort_by(|a, b| {
            let ord = compare_values(a.get(&order_by.field), b.get(&order_by.field));
            match order_by.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            }
        });
    }
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(usize::MAX);
    rows.into_iter().skip(offset).take(limit).collect()
}

/// Merges `patch` into `row`, keeping the id column `key`.
pub(crate) fn merge_row(row: &mut Row, patch: &Row, key: &str) {
    for (k, v) in patch {
        if k != key {
            row.insert(k.clone(), v.clone());
        }
    }
}
