//! CC2 session behavior: registration, heartbeat, request matching,
//! timeouts and shutdown, driven over an in-memory transport.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use common::{mock_wire, MockWire};
use elegoo_link::error::ElegooError;
use elegoo_link::protocol::{cc2_methods, Dialect};
use elegoo_link::session::{self, SessionConfig, SessionHandle, SessionState};
use elegoo_link::transport::WireFrame;

const SERIAL: &str = "CC2XYZ";

fn cc2_dialect() -> Dialect {
    Dialect::Cc2 {
        serial: SERIAL.to_string(),
        client_id: "0cli123456".to_string(),
    }
}

fn response_topic() -> String {
    format!("elegoo/{SERIAL}/0cli123456/api_response")
}

/// Answer the registration handshake with the given error string.
async fn respond_registration(wire: &mut MockWire, error: &str) {
    loop {
        let frame = wire.outbound.recv().await.expect("wire closed");
        if frame.topic.as_deref() == Some(&format!("elegoo/{SERIAL}/api_register")) {
            let payload: Value = serde_json::from_str(&frame.payload).unwrap();
            let request_id = payload["request_id"].as_str().unwrap().to_string();
            let reply = WireFrame {
                topic: Some(format!("elegoo/{SERIAL}/{request_id}/register_response")),
                payload: json!({ "error": error }).to_string(),
            };
            wire.inbound.send(reply).unwrap();
            return;
        }
    }
}

/// Spawn a registered CC2 session over a mock wire.
async fn ready_session(config: SessionConfig) -> (SessionHandle, MockWire) {
    let (factory, mut wire) = mock_wire();
    let spawn = session::spawn(factory, cc2_dialect(), true, config);
    let (result, wire) = tokio::join!(spawn, async move {
        respond_registration(&mut wire, "ok").await;
        wire
    });
    let (handle, _join) = result.expect("session should open");
    (handle, wire)
}

/// Next command published on the api_request topic, skipping heartbeats.
async fn next_command(wire: &mut MockWire) -> (u64, u32, Value) {
    loop {
        let frame = timeout(Duration::from_secs(5), wire.outbound.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("wire closed");
        if frame.topic.as_deref() != Some(&format!("elegoo/{SERIAL}/0cli123456/api_request")) {
            continue;
        }
        let value: Value = serde_json::from_str(&frame.payload).unwrap();
        if value.get("type").and_then(Value::as_str) == Some("PING") {
            continue;
        }
        let id = value["id"].as_u64().unwrap();
        let method = value["method"].as_u64().unwrap() as u32;
        return (id, method, value["params"].clone());
    }
}

fn respond(wire: &MockWire, id: u64, method: u32, result: Value) {
    wire.inbound
        .send(WireFrame {
            topic: Some(response_topic()),
            payload: json!({ "id": id, "method": method, "result": result }).to_string(),
        })
        .unwrap();
}

#[tokio::test]
async fn registration_ok_reaches_ready() {
    let (handle, _wire) = ready_session(SessionConfig::default()).await;
    assert_eq!(handle.state(), SessionState::Ready);
}

#[tokio::test]
async fn registration_slot_exhausted_surfaces() {
    let (factory, mut wire) = mock_wire();
    let spawn = session::spawn(factory, cc2_dialect(), true, SessionConfig::default());
    let (result, _wire) = tokio::join!(spawn, async move {
        respond_registration(&mut wire, "too many clients").await;
        wire
    });
    assert!(matches!(result, Err(ElegooError::SlotExhausted)));
}

#[tokio::test]
async fn registration_other_error_surfaces() {
    let (factory, mut wire) = mock_wire();
    let spawn = session::spawn(factory, cc2_dialect(), true, SessionConfig::default());
    let (result, _wire) = tokio::join!(spawn, async move {
        respond_registration(&mut wire, "internal failure").await;
        wire
    });
    assert!(matches!(result, Err(ElegooError::RegistrationFailed(_))));
}

#[tokio::test]
async fn invoke_matches_response_by_request_id() {
    let (handle, mut wire) = ready_session(SessionConfig::default()).await;

    // The session opens with attributes and status requests; answer the
    // status one so the snapshot gets seeded.
    let responder = tokio::spawn(async move {
        loop {
            let (id, method, _params) = next_command(&mut wire).await;
            match method {
                m if m == cc2_methods::GET_ATTRIBUTES => {
                    respond(&wire, id, method, json!({ "machine_model": "Centauri Carbon 2" }));
                }
                m if m == cc2_methods::GET_STATUS => {
                    respond(
                        &wire,
                        id,
                        method,
                        json!({ "sequence": 5, "status": 0, "temp_extruder": 24.5 }),
                    );
                }
                m if m == cc2_methods::PAUSE_PRINT => {
                    respond(&wire, id, method, json!({ "error_code": 0 }));
                    break;
                }
                _ => {}
            }
        }
        wire
    });

    let resp = timeout(
        Duration::from_secs(5),
        handle.invoke(cc2_methods::PAUSE_PRINT, json!({}), None),
    )
    .await
    .expect("invoke timed out")
    .expect("invoke failed");
    assert_eq!(resp.method, cc2_methods::PAUSE_PRINT);
    assert_eq!(resp.error_code, 0);

    responder.await.unwrap();
    // The answered GET_STATUS seeded the snapshot.
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.last_update_id, 5);
    assert_eq!(snapshot.temps.nozzle, 24.5);
}

#[tokio::test]
async fn application_error_codes_map_to_typed_errors() {
    let (handle, mut wire) = ready_session(SessionConfig::default()).await;

    let responder = tokio::spawn(async move {
        loop {
            let (id, method, _params) = next_command(&mut wire).await;
            if method == cc2_methods::START_PRINT {
                respond(&wire, id, method, json!({ "error_code": 1009 }));
                break;
            }
        }
        wire
    });

    let err = timeout(
        Duration::from_secs(5),
        handle.invoke(cc2_methods::START_PRINT, json!({ "filename": "x" }), None),
    )
    .await
    .expect("invoke timed out")
    .expect_err("busy printer should error");
    assert!(matches!(err, ElegooError::PrinterBusy));
    // The session survives an application error.
    assert!(handle.state().is_usable());
    responder.await.unwrap();
}

#[tokio::test]
async fn unanswered_invoke_times_out() {
    let (handle, _wire) = ready_session(SessionConfig::default()).await;

    let err = timeout(
        Duration::from_secs(4),
        handle.invoke(
            cc2_methods::SET_TEMPERATURE,
            json!({ "extruder": 200 }),
            Some(Duration::from_millis(300)),
        ),
    )
    .await
    .expect("local timeout should fire well before 4s")
    .expect_err("no response was sent");
    assert!(matches!(
        err,
        ElegooError::RequestTimeout {
            method: cc2_methods::SET_TEMPERATURE
        }
    ));
}

#[tokio::test]
async fn heartbeat_pings_flow_on_request_topic() {
    let config = SessionConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..SessionConfig::default()
    };
    let (_handle, mut wire) = ready_session(config).await;

    let found = timeout(Duration::from_secs(3), async {
        loop {
            let frame = wire.outbound.recv().await.expect("wire closed");
            if frame.topic.as_deref() == Some(&format!("elegoo/{SERIAL}/0cli123456/api_request"))
                && frame.payload.contains("PING")
            {
                return true;
            }
        }
    })
    .await
    .expect("no PING observed");
    assert!(found);
}

#[tokio::test]
async fn close_cancels_outstanding_invokes() {
    let (handle, _wire) = ready_session(SessionConfig::default()).await;

    let pending = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .invoke(cc2_methods::GET_DISK_INFO, json!({}), Some(Duration::from_secs(30)))
                .await
        })
    };
    // Give the invoke time to land in the in-flight table.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut updates = handle.subscribe();
    handle.close().await;

    let result = timeout(Duration::from_secs(3), pending)
        .await
        .expect("invoke should resolve on close")
        .unwrap();
    assert!(matches!(result, Err(ElegooError::SessionClosed)));

    // No further updates arrive after close; the stream ends.
    let ended = timeout(Duration::from_secs(3), async {
        loop {
            if updates.changed().await.is_err() {
                return true;
            }
        }
    })
    .await
    .expect("watch should close");
    assert!(ended);

    // New invokes are refused outright.
    let err = handle
        .invoke(cc2_methods::GET_STATUS, json!({}), None)
        .await
        .expect_err("session is closed");
    assert!(matches!(err, ElegooError::SessionClosed));
}
