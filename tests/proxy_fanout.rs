//! Proxy control plane end to end: two downstream WebSocket clients share
//! one mock-backed upstream session; request ids remap and responses route
//! back to their owner only, while status traffic reaches everyone.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use common::mock_wire;
use elegoo_link::protocol::Dialect;
use elegoo_link::proxy::ws as proxy_ws;
use elegoo_link::session::{self, SessionConfig};
use elegoo_link::transport::WireFrame;

const MAINBOARD: &str = "PRX";

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(port: u16) -> WsClient {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/websocket"))
        .await
        .expect("downstream connect");
    client
}

async fn next_text(client: &mut WsClient) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for downstream frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("downstream frame is json");
        }
    }
}

#[tokio::test]
async fn remaps_requests_and_routes_responses_to_owner() {
    let (factory, mut wire) = mock_wire();
    let dialect = Dialect::SdcpWs {
        mainboard_id: MAINBOARD.to_string(),
    };
    let (session, _join) = session::spawn(factory, dialect, true, SessionConfig::default())
        .await
        .expect("session open");

    let (_tasks, port) = proxy_ws::start(session.clone(), 0).await.expect("proxy up");

    let mut client_a = connect(port).await;
    let mut client_b = connect(port).await;
    // Let both attach before traffic flows.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A sends a command with its own request id 7.
    let request = json!({
        "Id": "conn",
        "Data": { "Cmd": 0, "RequestID": "0000000000000007", "Data": {}, "MainboardID": MAINBOARD },
        "Topic": format!("sdcp/request/{MAINBOARD}"),
    });
    client_a
        .send(Message::Text(request.to_string().into()))
        .await
        .unwrap();

    // Upstream sees a remapped, globally unique id (the proxy's range is
    // distinct from the session's own request ids).
    let expected = format!("{:016x}", 1001u64);
    let upstream_id = timeout(Duration::from_secs(5), async {
        loop {
            let frame = wire.outbound.recv().await.expect("wire closed");
            let Ok(value) = serde_json::from_str::<Value>(&frame.payload) else {
                continue;
            };
            let id = value
                .pointer("/Data/RequestID")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if id == expected {
                return id;
            }
        }
    })
    .await
    .expect("no remapped frame upstream");

    // The printer answers the remapped id; only A gets it, with its own id.
    wire.inbound
        .send(WireFrame::text(
            json!({
                "Id": "conn",
                "Data": { "Cmd": 0, "RequestID": upstream_id, "Data": { "Ack": 0 } },
                "Topic": format!("sdcp/response/{MAINBOARD}"),
            })
            .to_string(),
        ))
        .unwrap();

    let reply = next_text(&mut client_a).await;
    assert_eq!(reply["Data"]["RequestID"], json!("0000000000000007"));

    // A status event broadcasts to both downstreams unmodified.
    let status = json!({
        "Status": { "CurrentStatus": [0], "TimeStamp": 42 },
        "MainboardID": MAINBOARD,
        "TimeStamp": 42,
        "Topic": format!("sdcp/status/{MAINBOARD}"),
    });
    wire.inbound
        .send(WireFrame::text(status.to_string()))
        .unwrap();

    let status_a = next_text(&mut client_a).await;
    let status_b = next_text(&mut client_b).await;
    assert_eq!(status_a, status);
    assert_eq!(status_b, status);
}

#[tokio::test]
async fn unparseable_frames_pass_through_to_upstream() {
    let (factory, mut wire) = mock_wire();
    let dialect = Dialect::SdcpWs {
        mainboard_id: MAINBOARD.to_string(),
    };
    let (session, _join) = session::spawn(factory, dialect, true, SessionConfig::default())
        .await
        .expect("session open");
    let (_tasks, port) = proxy_ws::start(session.clone(), 0).await.expect("proxy up");

    let mut client = connect(port).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    client
        .send(Message::Text("M105 not json".to_string().into()))
        .await
        .unwrap();

    let passed = timeout(Duration::from_secs(5), async {
        loop {
            let frame = wire.outbound.recv().await.expect("wire closed");
            if frame.payload == "M105 not json" {
                return true;
            }
        }
    })
    .await
    .expect("frame never reached upstream");
    assert!(passed);
}
