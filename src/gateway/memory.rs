//! In-process [`RemoteStore`] with fault injection.
//!
//! Rows live in per-resource vectors in insertion order. Successful writes
//! are echoed to subscribers the way a realtime backend would. Tests can
//! hold writes and lookups at a gate, queue failures, and break subscription
//! streams.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::debug;

use crate::{
    error::GatewayError,
    op::{RemoteOp, RemoteWrite},
    schema::ResourceSchema,
    types::{EntityId, Row, SubscriptionId},
};

use super::{
    ChangeEvent, ChangeKind, EventScope, FetchQuery, KeyColumns, RemoteStore, Subscription,
    apply_query, fanout::SubscriberSet, merge_row, row_id,
};

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    keys: KeyColumns,
    next_id: u64,
    mutation_faults: VecDeque<GatewayError>,
    fetch_faults: VecDeque<GatewayError>,
    lookup_fault: Option<GatewayError>,
    fetch_calls: usize,
    mutate_calls: usize,
    lookup_calls: usize,
}

/// Reference gateway backed by process memory.
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
    subscribers: SubscriberSet,
    gate: watch::Sender<bool>,
    echo: bool,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    /// Empty store that echoes its own writes to subscribers.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
            subscribers: SubscriberSet::default(),
            gate,
            echo: true,
        }
    }

    /// Empty store that does not echo writes.
    pub fn silent() -> Self {
        Self {
            echo: false,
            ..Self::new()
        }
    }

    /// Uses the id column declared by `schema` for its resource. Register
    /// before seeding.
    pub fn register(&self, schema: &ResourceSchema) {
        self.lock().keys.register(schema);
    }

    /// Replaces the rows of `resource`.
    pub fn seed(&self, resource: &str, rows: impl IntoIterator<Item = Value>) {
        let rows: Vec<Row> = rows
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        let mut state = self.lock();
        let key = state.keys.column(resource).to_string();
        for row in &rows {
            if let Some(n) = row_id(row, &key).and_then(|id| id.parse::<u64>().ok()) {
                state.next_id = state.next_id.max(n + 1);
            }
        }
        state.tables.insert(resource.to_string(), rows);
    }

    /// Current rows of `resource` in insertion order.
    pub fn rows(&self, resource: &str) -> Vec<Row> {
        self.lock().tables.get(resource).cloned().unwrap_or_default()
    }

    /// Row of `resource` with id `id`.
    pub fn row(&self, resource: &str, id: &str) -> Option<Row> {
        let state = self.lock();
        let key = state.keys.column(resource);
        state
            .tables
            .get(resource)
            .and_then(|rows| rows.iter().find(|r| row_id(r, key).as_deref() == Some(id)).cloned())
    }

    /// Pushes an externally originated event; returns deliveries.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        self.subscribers.publish(&event)
    }

    /// Fails the next `mutate` call with `err`.
    pub fn fail_next_mutation(&self, err: GatewayError) {
        self.lock().mutation_faults.push_back(err);
    }

    /// Fails the next `fetch` call with `err`.
    pub fn fail_next_fetch(&self, err: GatewayError) {
        self.lock().fetch_faults.push_back(err);
    }

    /// Fails every lookup while set.
    pub fn fail_lookups(&self, err: Option<GatewayError>) {
        self.lock().lookup_fault = err;
    }

    /// Parks every subsequent `mutate` and `batched_lookup` call until
    /// [`Self::release`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Lets parked and future calls proceed.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Sends a transport error to every subscription of `resource`.
    pub fn break_subscriptions(&self, resource: &str, err: GatewayError) -> usize {
        self.subscribers.fail(resource, err)
    }

    /// Open subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn fetch_calls(&self) -> usize {
        self.lock().fetch_calls
    }

    pub fn mutate_calls(&self) -> usize {
        self.lock().mutate_calls
    }

    pub fn lookup_calls(&self) -> usize {
        self.lock().lookup_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn pass_gate(&self) -> Result<(), GatewayError> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| GatewayError::Closed)?;
        Ok(())
    }

    fn apply_write(&self, write: &RemoteWrite) -> Result<(Row, ChangeEvent), GatewayError> {
        let mut state = self.lock();
        state.mutate_calls += 1;
        if let Some(err) = state.mutation_faults.pop_front() {
            return Err(err);
        }

        let not_found = |id: &str| GatewayError::NotFound {
            resource: write.resource.clone(),
            id: id.to_string(),
        };

        let key = state.keys.column(&write.resource).to_string();
        let (row, kind) = match write.op {
            RemoteOp::Insert => {
                let mut row = write.payload.clone();
                let id = match row_id(&row, &key) {
                    Some(id) => id,
                    None => {
                        let n = state.next_id;
                        state.next_id += 1;
                        row.insert(key.clone(), json!(n.to_string()));
                        n.to_string()
                    }
                };
                row.entry("created_at").or_insert_with(|| json!(now_ms()));
                let table = state.tables.entry(write.resource.clone()).or_default();
                if table.iter().any(|r| row_id(r, &key).as_deref() == Some(id.as_str())) {
                    return Err(GatewayError::Rejected(format!("duplicate key {id}")));
                }
                table.push(row.clone());
                (row, ChangeKind::Insert)
            }
            RemoteOp::Update => {
                let id = write.match_id.as_deref().unwrap_or_default();
                let table = state.tables.entry(write.resource.clone()).or_default();
                let row = table
                    .iter_mut()
                    .find(|r| row_id(r, &key).as_deref() == Some(id))
                    .ok_or_else(|| not_found(id))?;
                merge_row(row, &write.payload, &key);
                (row.clone(), ChangeKind::Update)
            }
            RemoteOp::Delete => {
                let id = write.match_id.as_deref().unwrap_or_default();
                let table = state.tables.entry(write.resource.clone()).or_default();
                let idx = table
                    .iter()
                    .position(|r| row_id(r, &key).as_deref() == Some(id))
                    .ok_or_else(|| not_found(id))?;
                (table.remove(idx), ChangeKind::Delete)
            }
        };

        let id = row_id(&row, &key).map(EntityId::Server).ok_or(GatewayError::Closed)?;
        let event = ChangeEvent {
            resource: write.resource.clone(),
            kind,
            id,
            row: Some(row.clone()),
        };
        Ok((row, event))
    }
}

#[async_trait]
impl RemoteStore for MemoryGateway {
    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<Row>, GatewayError> {
        let mut state = self.lock();
        state.fetch_calls += 1;
        if let Some(err) = state.fetch_faults.pop_front() {
            return Err(err);
        }
        let rows = state.tables.get(&query.resource).cloned().unwrap_or_default();
        Ok(apply_query(rows, query))
    }

    async fn mutate(&self, write: &RemoteWrite) -> Result<Option<Row>, GatewayError> {
        self.pass_gate().await?;
        let (row, event) = self.apply_write(write)?;
        debug!(resource = %write.resource, op = ?write.op, id = %event.id, "memory write applied");
        if self.echo {
            self.subscribers.publish(&event);
        }
        Ok(Some(row))
    }

    async fn subscribe(&self, resource: &str, scope: &EventScope) -> Result<Subscription, GatewayError> {
        Ok(self.subscribers.add(resource, scope))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id);
    }

    async fn batched_lookup(
        &self,
        resource: &str,
        display_field: &str,
        ids: &[String],
    ) -> Result<HashMap<String, String>, GatewayError> {
        self.pass_gate().await?;
        let mut state = self.lock();
        state.lookup_calls += 1;
        if let Some(err) = state.lookup_fault.clone() {
            return Err(err);
        }
        let mut out = HashMap::new();
        let key = state.keys.column(resource);
        if let Some(rows) = state.tables.get(resource) {
            for row in rows {
                let Some(id) = row_id(row, key) else { continue };
                if !ids.contains(&id) {
                    continue;
                }
                if let Some(name) = row.get(display_field).and_then(Value::as_str) {
                    out.insert(id, name.to_string());
                }
            }
        }
        Ok(out)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
