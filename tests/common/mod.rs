#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};
use storesync::{
    core::{cache::ResourceCache, executor::MutationExecutor},
    schema::ResourceSchema,
    types::Row,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().expect("object row")
}

pub fn zone_rows() -> Vec<Value> {
    vec![
        json!({"id": "z1", "name": "Centro", "fee": 5.0, "is_active": true}),
        json!({"id": "z2", "name": "Norte", "fee": 7.5, "is_active": true}),
        json!({"id": "z3", "name": "Sul", "fee": 6.0, "is_active": false}),
    ]
}

/// Cache and executor loaded with `rows`.
pub fn loaded(schema: ResourceSchema, rows: &[Value]) -> (ResourceCache, MutationExecutor) {
    let schema = Arc::new(schema);
    let mut cache = ResourceCache::new(schema.order_by.clone());
    let entities = rows
        .iter()
        .map(|r| schema.ingest_value(r).expect("valid row"))
        .collect();
    cache.load(entities);
    (cache, MutationExecutor::new(schema))
}
