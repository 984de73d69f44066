mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use storesync::{
    config::EngineConfig,
    error::GatewayError,
    gateway::{ChangeKind, EventScope, FetchQuery, RemoteStore, sqlite::SqliteGateway},
    op::{RemoteOp, RemoteWrite},
    runtime::handle::spawn_resource,
    entity::FieldPatch,
    schema::{Direction, FieldKind, OrderBy, ResourceSchema, catalog},
    types::EntityId,
};

use common::row;

fn write(resource: &str, op: RemoteOp, payload: serde_json::Value, match_id: Option<&str>) -> RemoteWrite {
    RemoteWrite {
        resource: resource.to_string(),
        op,
        payload: row(payload),
        match_id: match_id.map(str::to_string),
    }
}

#[tokio::test]
async fn rows_survive_reopen() {
    common::init_tracing();
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("store.db");

    let gateway = SqliteGateway::open(&db_path).expect("open sqlite");
    let created = gateway
        .mutate(&write("banners", RemoteOp::Insert, json!({"title": "Promo", "sort_order": 0}), None))
        .await
        .expect("insert")
        .expect("row");
    assert_eq!(created["id"], json!("1"));
    assert!(created.contains_key("created_at"));

    gateway
        .mutate(&write("banners", RemoteOp::Update, json!({"title": "Promo 2"}), Some("1")))
        .await
        .expect("update");
    gateway
        .mutate(&write("banners", RemoteOp::Insert, json!({"title": "Combo", "sort_order": 1}), None))
        .await
        .expect("insert");
    drop(gateway);

    let reopened = SqliteGateway::open(&db_path).expect("reopen");
    let rows = reopened.fetch(&FetchQuery::new("banners")).await.expect("fetch");
    let titles: Vec<_> = rows.iter().map(|r| r["title"].clone()).collect();
    assert_eq!(titles, vec![json!("Promo 2"), json!("Combo")]);

    let next = reopened
        .mutate(&write("banners", RemoteOp::Insert, json!({"title": "Pix"}), None))
        .await
        .expect("insert")
        .expect("row");
    assert_eq!(next["id"], json!("3"));
}

#[tokio::test]
async fn missing_rows_and_duplicates_are_reported() {
    let gateway = SqliteGateway::open_in_memory().expect("open");
    let err = gateway
        .mutate(&write("banners", RemoteOp::Delete, json!({}), Some("9")))
        .await
        .expect_err("missing");
    assert_eq!(err, GatewayError::NotFound { resource: "banners".into(), id: "9".into() });

    gateway
        .mutate(&write("users", RemoteOp::Insert, json!({"id": "u1", "name": "Ana"}), None))
        .await
        .expect("insert");
    let dup = gateway
        .mutate(&write("users", RemoteOp::Insert, json!({"id": "u1", "name": "Bia"}), None))
        .await
        .expect_err("duplicate");
    assert!(matches!(dup, GatewayError::Rejected(_)));
}

#[tokio::test]
async fn fetch_orders_filters_and_pages() {
    let gateway = SqliteGateway::open_in_memory().expect("open");
    for i in 0..6 {
        gateway
            .mutate(&write(
                "audit_logs",
                RemoteOp::Insert,
                json!({"action": "update", "entity": if i % 2 == 0 { "banners" } else { "users" }, "created_at": i}),
                None,
            ))
            .await
            .expect("insert");
    }

    let query = FetchQuery::new("audit_logs")
        .filter("entity", json!("banners"))
        .order(OrderBy::created_at("created_at", Direction::Desc))
        .page(1, 5);
    let rows = gateway.fetch(&query).await.expect("fetch");
    let stamps: Vec<_> = rows.iter().map(|r| r["created_at"].clone()).collect();
    assert_eq!(stamps, vec![json!(2), json!(0)]);
}

#[tokio::test]
async fn lookups_and_echoes() {
    let gateway = SqliteGateway::open_in_memory().expect("open");
    let mut sub = gateway.subscribe("users", &EventScope::All).await.expect("subscribe");

    for (id, name) in [("u1", "Ana"), ("u2", "Bruno")] {
        gateway
            .mutate(&write("users", RemoteOp::Insert, json!({"id": id, "name": name}), None))
            .await
            .expect("insert");
    }
    let first = sub.events.recv().await.expect("event").expect("ok");
    assert_eq!(first.kind, ChangeKind::Insert);
    assert_eq!(first.id, EntityId::from("u1"));

    let names = gateway
        .batched_lookup("users", "name", &["u2".to_string(), "u404".to_string()])
        .await
        .expect("lookup");
    assert_eq!(names.len(), 1);
    assert_eq!(names.get("u2").map(String::as_str), Some("Bruno"));

    gateway.unsubscribe(sub.id);
    while sub.events.recv().await.is_some() {}
}

#[tokio::test]
async fn runtime_over_sqlite_round_trips() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("zones.db");
    let gateway: Arc<dyn RemoteStore> = Arc::new(SqliteGateway::open(&db_path).expect("open"));

    let zones = spawn_resource(Arc::clone(&gateway), catalog::delivery_zones(), &EngineConfig::default());
    zones.load().await.expect("load");
    let created = zones
        .create(row(json!({"name": "Centro", "fee": 5.0, "is_active": true})))
        .await
        .expect("create");
    assert!(!zones.toggle(created.id.clone(), "is_active").await.expect("toggle"));
    zones.shutdown().await.expect("shutdown");

    let again = spawn_resource(gateway, catalog::delivery_zones(), &EngineConfig::default());
    assert_eq!(again.load().await.expect("load"), 1);
    let view = again.state();
    let zone = view.get(&created.id).expect("zone");
    assert!(!zone.flag("is_active"));
    assert_eq!(zone.get("fee"), Some(&json!(5.0)));
}

#[tokio::test]
async fn declared_id_column_is_used_for_keys() {
    let mut coupons = ResourceSchema::new("coupons", OrderBy::name("label"))
        .required("label", FieldKind::Text)
        .field("pct", FieldKind::Integer);
    coupons.id_field = "code".into();

    let gateway = SqliteGateway::open_in_memory().expect("open").with_schema(&coupons);
    let created = gateway
        .mutate(&write("coupons", RemoteOp::Insert, json!({"label": "Boas-vindas", "pct": 10}), None))
        .await
        .expect("insert")
        .expect("row");
    assert_eq!(created["code"], json!("1"));
    assert!(!created.contains_key("id"));

    let gateway: Arc<dyn RemoteStore> = Arc::new(gateway);
    let handle = spawn_resource(Arc::clone(&gateway), coupons, &EngineConfig::default());
    assert_eq!(handle.load().await.expect("load"), 1);
    let updated = handle
        .update(EntityId::from("1"), FieldPatch::one("pct", json!(15)))
        .await
        .expect("update");
    assert_eq!(updated.get("pct"), Some(&json!(15)));

    let rows = gateway.fetch(&FetchQuery::new("coupons")).await.expect("fetch");
    assert_eq!(rows[0]["pct"], json!(15));
    assert_eq!(rows[0]["code"], json!("1"));
}
