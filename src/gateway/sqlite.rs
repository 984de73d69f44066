//! SQLite-backed [`RemoteStore`] keeping each row as a JSON document.

use std::{
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use hashbrown::HashMap;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Value, json};
use tokio::sync::Mutex;
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

/// Local stand-in for the hosted store, durable across restarts.
pub struct SqliteGateway {
    conn: Arc<Mutex<Connection>>,
    subscribers: Arc<SubscriberSet>,
    keys: KeyColumns,
}

impl SqliteGateway {
    /// Opens or creates a database at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let conn = Connection::open(path).map_err(store_err)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> Result<Self, GatewayError> {
        conn.execute_batch(include_str!("schema.sql")).map_err(store_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(store_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            subscribers: Arc::new(SubscriberSet::default()),
            keys: KeyColumns::default(),
        })
    }

    /// Uses the id column declared by `schema` for its resource.
    pub fn with_schema(mut self, schema: &ResourceSchema) -> Self {
        self.keys.register(schema);
        self
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, GatewayError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| GatewayError::Transient(format!("join error: {e}")))?
    }
}

#[async_trait]
impl RemoteStore for SqliteGateway {
    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<Row>, GatewayError> {
        let resource = query.resource.clone();
        let rows = self.blocking(move |conn| load_rows(conn, &resource)).await?;
        Ok(apply_query(rows, query))
    }

    async fn mutate(&self, write: &RemoteWrite) -> Result<Option<Row>, GatewayError> {
        let owned = write.clone();
        let key = self.keys.column(&write.resource).to_string();
        let (row, event) = self.blocking(move |conn| apply_write(conn, &owned, &key)).await?;
        debug!(resource = %write.resource, op = ?write.op, id = %event.id, "sqlite write applied");
        self.subscribers.publish(&event);
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
        let resource = resource.to_string();
        let display_field = display_field.to_string();
        let ids = ids.to_vec();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare("SELECT payload FROM rows WHERE resource = ?1 AND id = ?2")
                .map_err(store_err)?;
            let mut out = HashMap::new();
            for id in ids {
                let payload: Option<String> = stmt
                    .query_row(params![resource, id], |row| row.get(0))
                    .optional()
                    .map_err(store_err)?;
                let Some(payload) = payload else { continue };
                let row = decode_row(&payload)?;
                if let Some(name) = row.get(&display_field).and_then(Value::as_str) {
                    out.insert(id, name.to_string());
                }
            }
            Ok(out)
        })
        .await
    }
}

fn load_rows(conn: &mut Connection, resource: &str) -> Result<Vec<Row>, GatewayError> {
    let mut stmt = conn
        .prepare("SELECT payload FROM rows WHERE resource = ?1 ORDER BY seq ASC")
        .map_err(store_err)?;
    let payloads = stmt
        .query_map(params![resource], |row| row.get::<_, String>(0))
        .map_err(store_err)?;

    let mut out = Vec::new();
    for payload in payloads {
        out.push(decode_row(&payload.map_err(store_err)?)?);
    }
    Ok(out)
}

fn find_row(conn: &Connection, resource: &str, id: &str) -> Result<Option<Row>, GatewayError> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM rows WHERE resource = ?1 AND id = ?2",
            params![resource, id],
            |row| row.get(0),
        )
        .optional()
        .map_err(store_err)?;
    payload.map(|p| decode_row(&p)).transpose()
}

fn apply_write(
    conn: &mut Connection,
    write: &RemoteWrite,
    key: &str,
) -> Result<(Row, ChangeEvent), GatewayError> {
    let tx = conn.transaction().map_err(store_err)?;
    let not_found = |id: &str| GatewayError::NotFound {
        resource: write.resource.clone(),
        id: id.to_string(),
    };

    let (row, kind) = match write.op {
        RemoteOp::Insert => {
            let mut row = write.payload.clone();
            let id = match row_id(&row, key) {
                Some(id) => id,
                None => {
                    let id = next_id(&tx, &write.resource)?.to_string();
                    row.insert(key.to_string(), json!(id));
                    id
                }
            };
            row.entry("created_at").or_insert_with(|| json!(now_ms()));
            if find_row(&tx, &write.resource, &id)?.is_some() {
                return Err(GatewayError::Rejected(format!("duplicate key {id}")));
            }
            let seq: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM rows WHERE resource = ?1",
                    params![write.resource],
                    |r| r.get(0),
                )
                .map_err(store_err)?;
            tx.execute(
                "INSERT INTO rows(resource, id, seq, payload) VALUES (?1, ?2, ?3, ?4)",
                params![write.resource, id, seq, encode_row(&row)?],
            )
            .map_err(store_err)?;
            (row, ChangeKind::Insert)
        }
        RemoteOp::Update => {
            let id = write.match_id.as_deref().unwrap_or_default();
            let mut row = find_row(&tx, &write.resource, id)?.ok_or_else(|| not_found(id))?;
            merge_row(&mut row, &write.payload, key);
            tx.execute(
                "UPDATE rows SET payload = ?3 WHERE resource = ?1 AND id = ?2",
                params![write.resource, id, encode_row(&row)?],
            )
            .map_err(store_err)?;
            (row, ChangeKind::Update)
        }
        RemoteOp::Delete => {
            let id = write.match_id.as_deref().unwrap_or_default();
            let row = find_row(&tx, &write.resource, id)?.ok_or_else(|| not_found(id))?;
            tx.execute(
                "DELETE FROM rows WHERE resource = ?1 AND id = ?2",
                params![write.resource, id],
            )
            .map_err(store_err)?;
            (row, ChangeKind::Delete)
        }
    };
    tx.commit().map_err(store_err)?;

    let id = row_id(&row, key).map(EntityId::Server).ok_or(GatewayError::Closed)?;
    let event = ChangeEvent {
        resource: write.resource.clone(),
        kind,
        id,
        row: Some(row.clone()),
    };
    Ok((row, event))
}

fn next_id(conn: &Connection, resource: &str) -> Result<i64, GatewayError> {
    let current: Option<i64> = conn
        .query_row(
            "SELECT next_id FROM id_counters WHERE resource = ?1",
            params![resource],
            |row| row.get(0),
        )
        .optional()
        .map_err(store_err)?;
    let id = current.unwrap_or(1);
    conn.execute(
        "INSERT INTO id_counters(resource, next_id) VALUES (?1, ?2)
         ON CONFLICT(resource) DO UPDATE SET next_id = excluded.next_id",
        params![resource, id + 1],
    )
    .map_err(store_err)?;
    Ok(id)
}

fn encode_row(row: &Row) -> Result<String, GatewayError> {
    serde_json::to_string(row).map_err(|e| GatewayError::Rejected(format!("encode row: {e}")))
}

fn decode_row(payload: &str) -> Result<Row, GatewayError> {
    serde_json::from_str(payload).map_err(|e| GatewayError::Transient(format!("corrupt row payload: {e}")))
}

fn store_err(err: rusqlite::Error) -> GatewayError {
    GatewayError::Transient(format!("sqlite: {err}"))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
