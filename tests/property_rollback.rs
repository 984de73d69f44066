mod common;

use std::{collections::BTreeMap, sync::Arc};

use proptest::prelude::*;
use serde_json::json;
use storesync::{
    entity::FieldPatch,
    error::GatewayError,
    gateway::{ChangeEvent, ChangeKind, EventScope},
    op::RemoteWrite,
    realtime::reconciler::Reconciler,
    schema::catalog,
    types::{EntityId, MutationSeq, Row},
};

use common::{loaded, row, zone_rows};

#[derive(Debug, Clone)]
enum Step {
    Toggle(u8, bool),
    Fee(u8, u16, bool),
    Settle(u8),
    Push(u8, u16),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u8..3, any::<bool>()).prop_map(|(t, ok)| Step::Toggle(t, ok)),
        (0u8..3, 0u16..500, any::<bool>()).prop_map(|(t, fee, ok)| Step::Fee(t, fee, ok)),
        any::<u8>().prop_map(Step::Settle),
        (0u8..3, 0u16..500).prop_map(|(t, fee)| Step::Push(t, fee)),
    ]
}

fn zone_id(t: u8) -> EntityId {
    EntityId::from(format!("z{}", t + 1))
}

type Outcome = Result<Vec<Option<Row>>, GatewayError>;

/// Runs `writes` against the server rows when `ok`, the moment the request
/// is sent. The reply is delivered later, in whatever order the steps pick.
fn send(server: &mut BTreeMap<String, Row>, writes: &[RemoteWrite], ok: bool) -> Outcome {
    if !ok {
        return Err(GatewayError::Transient("boom".into()));
    }
    Ok(writes
        .iter()
        .map(|w| {
            let id = w.match_id.clone().expect("match id");
            let row = server.get_mut(&id).expect("server row");
            for (k, v) in &w.payload {
                row.insert(k.clone(), v.clone());
            }
            Some(row.clone())
        })
        .collect())
}

proptest! {
    #[test]
    fn replies_in_any_order_converge_to_server_state(
        steps in prop::collection::vec(step_strategy(), 1..120),
        tail in prop::collection::vec(any::<u8>(), 8),
    ) {
        let schema = catalog::delivery_zones();
        let (mut cache, mut exec) = loaded(catalog::delivery_zones(), &zone_rows());
        let mut rec = Reconciler::new(Arc::new(catalog::delivery_zones()));
        rec.retarget(Some(EventScope::All));

        let mut server: BTreeMap<String, Row> = zone_rows()
            .iter()
            .map(|r| {
                let entity = schema.ingest_value(r).expect("row");
                (entity.id.to_string(), entity.to_row("id"))
            })
            .collect();
        let mut pending: Vec<(MutationSeq, Outcome)> = Vec::new();

        for step in steps {
            match step {
                Step::Toggle(t, ok) => {
                    let p = exec.begin_toggle(&mut cache, &zone_id(t), "is_active").expect("toggle");
                    pending.push((p.seq, send(&mut server, &p.writes, ok)));
                }
                Step::Fee(t, fee, ok) => {
                    let patch = FieldPatch::one("fee", json!(f64::from(fee)));
                    let p = exec.begin_update(&mut cache, &zone_id(t), patch).expect("update");
                    pending.push((p.seq, send(&mut server, &p.writes, ok)));
                }
                Step::Settle(pick) => {
                    if pending.is_empty() {
                        continue;
                    }
                    let (seq, outcome) = pending.remove(usize::from(pick) % pending.len());
                    exec.settle(&mut cache, seq, outcome);
                }
                Step::Push(t, fee) => {
                    let id = zone_id(t);
                    let key = id.to_string();
                    server
                        .get_mut(&key)
                        .expect("server row")
                        .insert("fee".into(), json!(f64::from(fee)));
                    rec.merge(&mut cache, &mut exec, &ChangeEvent {
                        resource: "delivery_zones".into(),
                        kind: ChangeKind::Update,
                        id,
                        row: Some(row(json!({"id": key, "fee": f64::from(fee)}))),
                    });
                }
            }
        }

        let mut i = 0;
        while !pending.is_empty() {
            let pick = usize::from(tail[i % tail.len()]) % pending.len();
            let (seq, outcome) = pending.remove(pick);
            exec.settle(&mut cache, seq, outcome);
            i += 1;
        }

        prop_assert_eq!(exec.in_flight_len(), 0);
        prop_assert_eq!(cache.len(), server.len());
        for (key, row) in &server {
            let entity = cache.get(&EntityId::from(key.as_str())).expect("cached");
            prop_assert_eq!(&entity.to_row("id"), row);
        }
    }

    #[test]
    fn two_successful_toggles_restore_the_original_value(
        initial in any::<bool>(),
        second_first in any::<bool>(),
    ) {
        let (mut cache, mut exec) = loaded(
            catalog::delivery_zones(),
            &[json!({"id": "z1", "name": "Centro", "is_active": initial})],
        );
        let z1 = EntityId::from("z1");

        let t1 = exec.begin_toggle(&mut cache, &z1, "is_active").expect("t1");
        let t2 = exec.begin_toggle(&mut cache, &z1, "is_active").expect("t2");
        let reply = |value: bool| -> Outcome { Ok(vec![Some(row(json!({"id": "z1", "is_active": value})))]) };

        let order = if second_first {
            [(t2.seq, reply(initial)), (t1.seq, reply(!initial))]
        } else {
            [(t1.seq, reply(!initial)), (t2.seq, reply(initial))]
        };
        for (seq, outcome) in order {
            exec.settle(&mut cache, seq, outcome);
        }
        prop_assert_eq!(cache.get(&z1).expect("z1").flag("is_active"), initial);
    }
}
