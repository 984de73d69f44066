mod common;

use std::sync::Arc;

use serde_json::json;
use storesync::{
    core::executor::Settlement,
    entity::FieldPatch,
    error::{EngineError, GatewayError},
    gateway::{ChangeEvent, ChangeKind, EventScope},
    op::MutationKind,
    realtime::reconciler::{MergeOutcome, Reconciler},
    schema::catalog,
    types::EntityId,
};

use common::{loaded, row, zone_rows};

fn transient() -> GatewayError {
    GatewayError::Transient("connection reset".into())
}

fn push(resource: &str, kind: ChangeKind, value: serde_json::Value) -> ChangeEvent {
    let row = row(value);
    ChangeEvent {
        resource: resource.into(),
        kind,
        id: EntityId::from_json(&row["id"]).expect("id"),
        row: Some(row),
    }
}

fn tracking(schema: storesync::schema::ResourceSchema) -> Reconciler {
    let mut rec = Reconciler::new(Arc::new(schema));
    rec.retarget(Some(EventScope::All)).expect("generation");
    rec
}

#[test]
fn failed_zone_toggle_restores_prior_snapshot() {
    common::init_tracing();
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let before = cache.snapshot();
    let z2 = EntityId::from("z2");

    let pending = exec.begin_toggle(&mut cache, &z2, "is_active").expect("toggle");
    assert!(!cache.get(&z2).expect("z2").flag("is_active"));
    assert_eq!(pending.writes.len(), 1);
    assert_eq!(pending.writes[0].payload["is_active"], json!(false));

    let settled = exec.settle(&mut cache, pending.seq, Err(transient()));
    assert!(matches!(
        settled,
        Settlement::RolledBack { kind: MutationKind::Toggle, error: EngineError::Store(_), .. }
    ));
    assert_eq!(cache.snapshot(), before);
    assert_eq!(exec.in_flight_len(), 0);
}

#[test]
fn toggle_of_null_field_writes_true() {
    let (mut cache, mut exec) = loaded(
        catalog::delivery_zones(),
        &[json!({"id": "z9", "name": "Leste"})],
    );
    let id = EntityId::from("z9");
    let pending = exec.begin_toggle(&mut cache, &id, "is_active").expect("toggle");
    assert_eq!(pending.intent.deltas.get("is_active"), Some(&json!(true)));
    assert!(cache.get(&id).expect("z9").flag("is_active"));
}

#[test]
fn overlapping_toggles_first_fails_second_commits() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let z1 = EntityId::from("z1");

    let t1 = exec.begin_toggle(&mut cache, &z1, "is_active").expect("t1");
    let t2 = exec.begin_toggle(&mut cache, &z1, "is_active").expect("t2");
    assert!(cache.get(&z1).expect("z1").flag("is_active"));

    exec.settle(&mut cache, t1.seq, Err(transient()));
    assert!(cache.get(&z1).expect("z1").flag("is_active"));

    exec.settle(
        &mut cache,
        t2.seq,
        Ok(vec![Some(row(json!({"id": "z1", "is_active": true})))]),
    );
    assert!(cache.get(&z1).expect("z1").flag("is_active"));
}

#[test]
fn overlapping_toggles_first_commits_second_fails() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let z1 = EntityId::from("z1");

    let t1 = exec.begin_toggle(&mut cache, &z1, "is_active").expect("t1");
    let t2 = exec.begin_toggle(&mut cache, &z1, "is_active").expect("t2");

    exec.settle(
        &mut cache,
        t1.seq,
        Ok(vec![Some(row(json!({"id": "z1", "is_active": false})))]),
    );
    exec.settle(&mut cache, t2.seq, Err(transient()));
    assert!(!cache.get(&z1).expect("z1").flag("is_active"));
}

#[test]
fn toggle_pair_committing_out_of_order_restores_original_value() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let z1 = EntityId::from("z1");

    let t1 = exec.begin_toggle(&mut cache, &z1, "is_active").expect("t1");
    let t2 = exec.begin_toggle(&mut cache, &z1, "is_active").expect("t2");

    exec.settle(
        &mut cache,
        t2.seq,
        Ok(vec![Some(row(json!({"id": "z1", "is_active": true})))]),
    );
    exec.settle(
        &mut cache,
        t1.seq,
        Ok(vec![Some(row(json!({"id": "z1", "is_active": false})))]),
    );
    assert!(cache.get(&z1).expect("z1").flag("is_active"));
    assert_eq!(exec.in_flight_len(), 0);
}

#[test]
fn late_reply_does_not_overwrite_newer_push() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let rec = tracking(catalog::delivery_zones());
    let z1 = EntityId::from("z1");

    let pending = exec
        .begin_update(&mut cache, &z1, FieldPatch::one("fee", json!(9.0)))
        .expect("update");
    rec.merge(
        &mut cache,
        &mut exec,
        &push("delivery_zones", ChangeKind::Update, json!({"id": "z1", "fee": 11.0})),
    );

    exec.settle(
        &mut cache,
        pending.seq,
        Ok(vec![Some(row(json!({"id": "z1", "fee": 9.0})))]),
    );
    assert_eq!(cache.get(&z1).expect("z1").get("fee"), Some(&json!(11.0)));
}

#[test]
fn commit_hands_its_value_to_a_later_failing_update() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let z1 = EntityId::from("z1");

    let first = exec
        .begin_update(&mut cache, &z1, FieldPatch::one("fee", json!(7.0)))
        .expect("first");
    let second = exec
        .begin_update(&mut cache, &z1, FieldPatch::one("fee", json!(8.0)))
        .expect("second");

    exec.settle(&mut cache, first.seq, Ok(vec![None]));
    exec.settle(&mut cache, second.seq, Err(transient()));
    assert_eq!(cache.get(&z1).expect("z1").get("fee"), Some(&json!(7.0)));
}

#[test]
fn update_rollback_restores_only_its_own_fields() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let z1 = EntityId::from("z1");

    let mut patch = FieldPatch::default();
    patch.set("fee", json!(9.0));
    patch.set("eta_minutes", json!(40));
    let first = exec.begin_update(&mut cache, &z1, patch).expect("update");
    let second = exec
        .begin_update(&mut cache, &z1, FieldPatch::one("is_active", json!(false)))
        .expect("update");

    exec.settle(&mut cache, first.seq, Err(transient()));
    let zone = cache.get(&z1).expect("z1");
    assert_eq!(zone.get("fee"), Some(&json!(5.0)));
    assert_eq!(zone.get("eta_minutes"), Some(&json!(null)));
    assert!(!zone.flag("is_active"));

    exec.settle(&mut cache, second.seq, Err(transient()));
    assert!(cache.get(&z1).expect("z1").flag("is_active"));
}

#[test]
fn failed_delete_reinserts_at_former_index() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let before = cache.snapshot();
    let z2 = EntityId::from("z2");

    let pending = exec.begin_delete(&mut cache, &z2).expect("delete");
    assert!(!cache.contains(&z2));
    assert_eq!(pending.writes[0].match_id.as_deref(), Some("z2"));

    exec.settle(
        &mut cache,
        pending.seq,
        Err(GatewayError::NotFound { resource: "delivery_zones".into(), id: "z2".into() }),
    );
    assert_eq!(cache.index_of(&z2), Some(1));
    assert_eq!(cache.snapshot(), before);
}

#[test]
fn delete_confirmed_by_push_is_not_resurrected() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let rec = tracking(catalog::delivery_zones());
    let z2 = EntityId::from("z2");

    let pending = exec.begin_delete(&mut cache, &z2).expect("delete");
    let outcome = rec.merge(
        &mut cache,
        &mut exec,
        &push("delivery_zones", ChangeKind::Delete, json!({"id": "z2", "name": "Norte"})),
    );
    assert_eq!(outcome, MergeOutcome::Ignored);

    exec.settle(&mut cache, pending.seq, Err(transient()));
    assert!(!cache.contains(&z2));
    assert_eq!(cache.len(), 2);
}

#[test]
fn create_commit_replaces_local_entity() {
    let rows = [
        json!({"id": "b1", "title": "Frete grátis", "sort_order": 0}),
        json!({"id": "b2", "title": "Combo", "sort_order": 1}),
    ];
    let (mut cache, mut exec) = loaded(catalog::banners(), &rows);

    let pending = exec
        .begin_create(&mut cache, row(json!({"title": "Promo"})))
        .expect("create");
    let preview = pending.preview.clone().expect("preview");
    assert!(preview.id.is_local());
    assert_eq!(preview.get("sort_order"), Some(&json!(2)));
    assert_eq!(pending.writes[0].payload["sort_order"], json!(2));
    assert_eq!(cache.len(), 3);

    let settled = exec.settle(
        &mut cache,
        pending.seq,
        Ok(vec![Some(row(json!({"id": "b7", "title": "Promo", "sort_order": 2, "is_active": true})))]),
    );
    let Settlement::Committed { entity: Some(entity), .. } = settled else {
        panic!("expected commit");
    };
    assert_eq!(entity.id, EntityId::from("b7"));
    assert!(entity.flag("is_active"));
    assert_eq!(
        cache.ids(),
        vec![EntityId::from("b1"), EntityId::from("b2"), EntityId::from("b7")]
    );
    assert!(cache.entities().iter().all(|e| !e.id.is_local()));
}

#[test]
fn create_echo_before_completion_is_deduplicated() {
    let (mut cache, mut exec) = loaded(catalog::banners(), &[]);
    let rec = tracking(catalog::banners());

    let pending = exec
        .begin_create(&mut cache, row(json!({"title": "Promo"})))
        .expect("create");
    assert_eq!(pending.writes[0].payload["sort_order"], json!(0));

    let server = json!({"id": "b7", "title": "Promo", "sort_order": 0});
    let outcome = rec.merge(&mut cache, &mut exec, &push("banners", ChangeKind::Insert, server.clone()));
    assert_eq!(outcome, MergeOutcome::Inserted("b7".into()));
    assert_eq!(cache.len(), 2);

    exec.settle(&mut cache, pending.seq, Ok(vec![Some(row(server))]));
    assert_eq!(cache.ids(), vec![EntityId::from("b7")]);
}

#[test]
fn failed_create_removes_local_entity() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let before = cache.snapshot();

    let pending = exec
        .begin_create(&mut cache, row(json!({"name": "Oeste", "fee": 4.0})))
        .expect("create");
    assert_eq!(cache.len(), 4);

    exec.settle(&mut cache, pending.seq, Err(GatewayError::Rejected("duplicate name".into())));
    assert_eq!(cache.snapshot(), before);
}

#[test]
fn invalid_intents_never_touch_the_cache() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let before = cache.snapshot();
    let z1 = EntityId::from("z1");

    let errors = [
        exec.begin_toggle(&mut cache, &z1, "name").map(|_| ()),
        exec.begin_toggle(&mut cache, &z1, "colour").map(|_| ()),
        exec.begin_update(&mut cache, &z1, FieldPatch::one("fee", json!("cheap"))).map(|_| ()),
        exec.begin_update(&mut cache, &z1, FieldPatch::one("name", json!(null))).map(|_| ()),
        exec.begin_update(&mut cache, &z1, FieldPatch::one("id", json!("z5"))).map(|_| ()),
        exec.begin_update(&mut cache, &z1, FieldPatch::default()).map(|_| ()),
        exec.begin_create(&mut cache, row(json!({"fee": 3.0}))).map(|_| ()),
        exec.begin_reorder(&mut cache, &[z1.clone()]).map(|_| ()),
        exec.begin_toggle(&mut cache, &EntityId::Local(1), "is_active").map(|_| ()),
    ];
    for err in errors {
        assert!(matches!(err, Err(EngineError::Validation(_))), "{err:?}");
    }

    let missing = exec.begin_delete(&mut cache, &EntityId::from("z404"));
    assert!(matches!(missing, Err(EngineError::NotFound { .. })));

    assert_eq!(cache.snapshot(), before);
    assert_eq!(exec.in_flight_len(), 0);
}

#[test]
fn push_during_inflight_update_survives_rollback() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let rec = tracking(catalog::delivery_zones());
    let z1 = EntityId::from("z1");

    let pending = exec
        .begin_update(&mut cache, &z1, FieldPatch::one("fee", json!(9.0)))
        .expect("update");
    let outcome = rec.merge(
        &mut cache,
        &mut exec,
        &push("delivery_zones", ChangeKind::Update, json!({"id": "z1", "fee": 11.0})),
    );
    assert_eq!(outcome, MergeOutcome::Updated(z1.clone()));

    exec.settle(&mut cache, pending.seq, Err(transient()));
    assert_eq!(cache.get(&z1).expect("z1").get("fee"), Some(&json!(11.0)));
}

#[test]
fn concurrent_remote_delete_makes_rollback_a_no_op() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let rec = tracking(catalog::delivery_zones());
    let z1 = EntityId::from("z1");

    let pending = exec
        .begin_update(&mut cache, &z1, FieldPatch::one("fee", json!(9.0)))
        .expect("update");
    rec.merge(
        &mut cache,
        &mut exec,
        &push("delivery_zones", ChangeKind::Delete, json!({"id": "z1", "name": "Centro"})),
    );

    let settled = exec.settle(
        &mut cache,
        pending.seq,
        Err(GatewayError::NotFound { resource: "delivery_zones".into(), id: "z1".into() }),
    );
    assert!(matches!(settled, Settlement::RolledBack { error: EngineError::NotFound { .. }, .. }));
    assert!(!cache.contains(&z1));
    assert_eq!(cache.len(), 2);
}

#[test]
fn settlement_after_reload_leaves_cache_alone() {
    let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
    let z1 = EntityId::from("z1");
    let schema = catalog::delivery_zones();

    let pending = exec.begin_toggle(&mut cache, &z1, "is_active").expect("toggle");
    let fresh: Vec<_> = zone_rows()
        .iter()
        .map(|r| schema.ingest_value(r).expect("row"))
        .collect();
    cache.load(fresh);
    let reloaded = cache.snapshot();

    exec.settle(&mut cache, pending.seq, Err(transient()));
    assert_eq!(cache.snapshot(), reloaded);
}

#[test]
fn loading_twice_yields_identical_cache() {
    let schema = catalog::delivery_zones();
    let (mut cache, _) = loaded(catalog::delivery_zones(), &zone_rows());
    let first = cache.snapshot();
    let again: Vec<_> = zone_rows()
        .iter()
        .map(|r| schema.ingest_value(r).expect("row"))
        .collect();
    cache.load(again);
    assert_eq!(cache.snapshot(), first);
}

#[test]
fn failed_reorder_restores_arrangement() {
    let rows = [
        json!({"id": "b1", "title": "A", "sort_order": 0}),
        json!({"id": "b2", "title": "B", "sort_order": 1}),
        json!({"id": "b3", "title": "C", "sort_order": 2}),
    ];
    let (mut cache, mut exec) = loaded(catalog::banners(), &rows);
    let before = cache.snapshot();
    let order: Vec<EntityId> = vec!["b3".into(), "b1".into(), "b2".into()];

    let pending = exec.begin_reorder(&mut cache, &order).expect("reorder");
    assert_eq!(cache.ids(), order);
    assert_eq!(pending.writes.len(), 3);
    assert_eq!(cache.get(&"b3".into()).expect("b3").get("sort_order"), Some(&json!(0)));

    exec.settle(&mut cache, pending.seq, Err(transient()));
    assert_eq!(cache.snapshot(), before);
}

#[test]
fn reorder_rejects_partial_or_duplicate_lists() {
    let rows = [
        json!({"id": "b1", "title": "A", "sort_order": 0}),
        json!({"id": "b2", "title": "B", "sort_order": 1}),
    ];
    let (mut cache, mut exec) = loaded(catalog::banners(), &rows);
    let dup = exec.begin_reorder(&mut cache, &[EntityId::from("b1"), EntityId::from("b1")]);
    assert!(matches!(dup, Err(EngineError::Validation(_))));
    let short = exec.begin_reorder(&mut cache, &[EntityId::from("b2")]);
    assert!(matches!(short, Err(EngineError::Validation(_))));
    assert_eq!(cache.ids(), vec![EntityId::from("b1"), EntityId::from("b2")]);
}
