//! Delta-status reconstruction: merging, sequence continuity, forced
//! refreshes and total-layer recovery.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use common::{mock_wire, MockWire};
use elegoo_link::model::MachineState;
use elegoo_link::protocol::{cc2_methods, Dialect};
use elegoo_link::session::{self, SessionConfig, SessionHandle};
use elegoo_link::transport::WireFrame;

const SERIAL: &str = "CC2DLT";

fn dialect() -> Dialect {
    Dialect::Cc2 {
        serial: SERIAL.to_string(),
        client_id: "0cliaaaaaa".to_string(),
    }
}

async fn ready_session() -> (SessionHandle, MockWire) {
    let (factory, mut wire) = mock_wire();
    let spawn = session::spawn(factory, dialect(), true, SessionConfig::default());
    let (result, wire) = tokio::join!(spawn, async move {
        loop {
            let frame = wire.outbound.recv().await.expect("wire closed");
            if frame.topic.as_deref() == Some(&format!("elegoo/{SERIAL}/api_register")) {
                let payload: Value = serde_json::from_str(&frame.payload).unwrap();
                let request_id = payload["request_id"].as_str().unwrap().to_string();
                wire.inbound
                    .send(WireFrame {
                        topic: Some(format!("elegoo/{SERIAL}/{request_id}/register_response")),
                        payload: json!({ "error": "ok" }).to_string(),
                    })
                    .unwrap();
                break;
            }
        }
        wire
    });
    let (handle, _join) = result.expect("session should open");
    (handle, wire)
}

/// Answer the initial status request so the session holds a full tree.
async fn seed_full_status(wire: &mut MockWire, sequence: u64) {
    loop {
        let frame = timeout(Duration::from_secs(5), wire.outbound.recv())
            .await
            .expect("no initial status request")
            .expect("wire closed");
        let Ok(value) = serde_json::from_str::<Value>(&frame.payload) else {
            continue;
        };
        let Some(method) = value.get("method").and_then(Value::as_u64) else {
            continue;
        };
        if method as u32 == cc2_methods::GET_STATUS {
            let id = value["id"].as_u64().unwrap();
            wire.inbound
                .send(WireFrame {
                    topic: Some(format!("elegoo/{SERIAL}/0cliaaaaaa/api_response")),
                    payload: json!({
                        "id": id,
                        "method": cc2_methods::GET_STATUS,
                        "result": {
                            "sequence": sequence,
                            "status": 0,
                            "temp_extruder": 25.0,
                            "temp_heater_bed": 23.0,
                        }
                    })
                    .to_string(),
                })
                .unwrap();
            return;
        }
    }
}

fn send_delta(wire: &MockWire, sequence: u64, fields: Value) {
    let mut result = fields;
    result["sequence"] = json!(sequence);
    wire.inbound
        .send(WireFrame {
            topic: Some(format!("elegoo/{SERIAL}/api_status")),
            payload: json!({ "id": 0, "method": cc2_methods::EVENT_STATUS, "result": result })
                .to_string(),
        })
        .unwrap();
}

/// Wait until the snapshot satisfies a predicate.
async fn wait_snapshot(
    handle: &SessionHandle,
    what: &str,
    predicate: impl Fn(&elegoo_link::StatusSnapshot) -> bool,
) {
    let mut updates = handle.subscribe();
    timeout(Duration::from_secs(5), async {
        loop {
            if predicate(&updates.borrow().clone()) {
                return;
            }
            updates.changed().await.expect("snapshot stream ended");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("snapshot never satisfied: {what}"));
}

#[tokio::test]
async fn consecutive_deltas_merge_into_snapshot() {
    let (handle, mut wire) = ready_session().await;
    seed_full_status(&mut wire, 1).await;
    wait_snapshot(&handle, "seeded", |s| s.last_update_id == 1).await;

    send_delta(&wire, 2, json!({ "temp_extruder": 201.5 }));
    wait_snapshot(&handle, "nozzle updated", |s| {
        s.last_update_id == 2 && s.temps.nozzle == 201.5
    })
    .await;

    // Untouched fields survive the merge.
    assert_eq!(handle.snapshot().temps.bed, 23.0);

    send_delta(&wire, 3, json!({ "status": 1, "print_status": {
        "sub_status": 3, "filename": "benchy.gcode", "uuid": "t1", "total_layer": 100
    }}));
    wait_snapshot(&handle, "printing", |s| {
        s.machine == MachineState::Printing && s.print.filename == "benchy.gcode"
    })
    .await;
}

#[tokio::test]
async fn update_id_never_regresses() {
    let (handle, mut wire) = ready_session().await;
    seed_full_status(&mut wire, 10).await;
    wait_snapshot(&handle, "seeded", |s| s.last_update_id == 10).await;

    // A replayed older delta still merges but cannot move the id backwards.
    send_delta(&wire, 4, json!({ "temp_extruder": 99.0 }));
    wait_snapshot(&handle, "merged", |s| s.temps.nozzle == 99.0).await;
    assert_eq!(handle.snapshot().last_update_id, 10);
}

#[tokio::test]
async fn sequence_gaps_force_full_refresh() {
    let (handle, mut wire) = ready_session().await;
    seed_full_status(&mut wire, 1).await;
    wait_snapshot(&handle, "seeded", |s| s.last_update_id == 1).await;

    // Five discontinuous deltas: each skips an id, so every one mismatches.
    for sequence in [3u64, 5, 7, 9, 11] {
        send_delta(&wire, sequence, json!({ "temp_extruder": 30.0 }));
    }

    // The fifth mismatch triggers a fresh GET_STATUS upstream.
    let refreshed = timeout(Duration::from_secs(5), async {
        loop {
            let frame = wire.outbound.recv().await.expect("wire closed");
            let Ok(value) = serde_json::from_str::<Value>(&frame.payload) else {
                continue;
            };
            if value.get("method").and_then(Value::as_u64) == Some(cc2_methods::GET_STATUS as u64) {
                return true;
            }
        }
    })
    .await
    .expect("no full refresh was requested");
    assert!(refreshed);
}

#[tokio::test]
async fn missing_total_layers_triggers_file_detail_recovery() {
    let (handle, mut wire) = ready_session().await;
    seed_full_status(&mut wire, 1).await;
    wait_snapshot(&handle, "seeded", |s| s.last_update_id == 1).await;

    // Printing with a filename but no layer count.
    send_delta(&wire, 2, json!({ "status": 1, "print_status": {
        "sub_status": 3, "filename": "benchy.gcode", "uuid": "t1", "total_layer": 0
    }}));

    // The session asks for file details, once, and fills the count from the
    // reply. This firmware spells the field TotalLayers.
    let detail_id = timeout(Duration::from_secs(5), async {
        loop {
            let frame = wire.outbound.recv().await.expect("wire closed");
            let Ok(value) = serde_json::from_str::<Value>(&frame.payload) else {
                continue;
            };
            if value.get("method").and_then(Value::as_u64)
                == Some(cc2_methods::GET_FILE_DETAIL as u64)
            {
                assert_eq!(value["params"]["filename"], json!("benchy.gcode"));
                return value["id"].as_u64().unwrap();
            }
        }
    })
    .await
    .expect("no file detail request");

    wire.inbound
        .send(WireFrame {
            topic: Some(format!("elegoo/{SERIAL}/0cliaaaaaa/api_response")),
            payload: json!({
                "id": detail_id,
                "method": cc2_methods::GET_FILE_DETAIL,
                "result": { "TotalLayers": 200 }
            })
            .to_string(),
        })
        .unwrap();

    wait_snapshot(&handle, "layer count recovered", |s| {
        s.print.total_layers == 200
    })
    .await;
}
