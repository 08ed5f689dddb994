//! Proxy control plane: a local WebSocket endpoint fanning N downstream
//! clients onto the one upstream session.
//!
//! A single core task owns the downstream registry and the request-id map;
//! accept handlers and the upstream tap only talk to it over channels, so
//! ordering is deterministic and no locks are needed. Downstream frames have
//! their request ids rewritten to globally unique upstream ids; responses map
//! back; status traffic broadcasts to everyone unmodified.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::session::SessionHandle;
use crate::transport::WireFrame;

/// First upstream id handed out by the remapper.
const PROXY_ID_BASE: u64 = 1000;
/// Bounded per-downstream queue.
const DOWNSTREAM_QUEUE: usize = 64;
/// A queue stalled longer than this gets its client evicted.
const STALL_LIMIT: Duration = Duration::from_secs(2);
/// Close code sent to evicted consumers.
const SLOW_CONSUMER_CODE: u16 = 1013;

enum ProxyCtl {
    Attach {
        id: u64,
        queue: mpsc::Sender<String>,
    },
    Detach {
        id: u64,
    },
    FromDownstream {
        id: u64,
        payload: String,
    },
}

struct Downstream {
    queue: mpsc::Sender<String>,
    stalled_since: Option<Instant>,
}

struct SharedState {
    ctl_tx: mpsc::Sender<ProxyCtl>,
    next_downstream: AtomicU64,
}

/// Start the control plane. Returns the task handles and the bound port.
pub async fn start(session: SessionHandle, port: u16) -> Result<(Vec<JoinHandle<()>>, u16)> {
    let (ctl_tx, ctl_rx) = mpsc::channel(256);
    let core = tokio::spawn(core_task(session.clone(), ctl_rx));

    let state = Arc::new(SharedState {
        ctl_tx,
        next_downstream: AtomicU64::new(1),
    });
    let app = Router::new()
        .route("/websocket", get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let bound = listener.local_addr()?.port();
    tracing::info!("proxy websocket endpoint on :{bound}/websocket");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("proxy websocket server stopped: {e}");
        }
    });

    Ok((vec![core, server], bound))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_downstream(socket, state))
}

async fn handle_downstream(socket: WebSocket, state: Arc<SharedState>) {
    let id = state.next_downstream.fetch_add(1, Ordering::Relaxed);
    let (queue_tx, mut queue_rx) = mpsc::channel::<String>(DOWNSTREAM_QUEUE);
    if state
        .ctl_tx
        .send(ProxyCtl::Attach {
            id,
            queue: queue_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    tracing::debug!("downstream {id} attached");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drains the bounded queue. The core closes the queue to evict a
    // slow consumer; that turns into a SlowConsumer close frame here.
    let writer = tokio::spawn(async move {
        while let Some(text) = queue_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: SLOW_CONSUMER_CODE,
                reason: "slow consumer".into(),
            })))
            .await;
    });

    // Reader: forwards client frames into the core.
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if state
                    .ctl_tx
                    .send(ProxyCtl::FromDownstream {
                        id,
                        payload: text.to_string(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let _ = state.ctl_tx.send(ProxyCtl::Detach { id }).await;
    writer.abort();
    tracing::debug!("downstream {id} detached");
}

async fn core_task(session: SessionHandle, mut ctl_rx: mpsc::Receiver<ProxyCtl>) {
    let mut downstreams: HashMap<u64, Downstream> = HashMap::new();
    // upstream id (as routing key) -> (downstream id, original id value)
    let mut id_map: HashMap<String, (u64, Value)> = HashMap::new();
    let mut next_upstream_id = PROXY_ID_BASE;
    let mut tap = session.tap();
    let mut stall_tick = tokio::time::interval(Duration::from_millis(500));
    stall_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            ctl = ctl_rx.recv() => match ctl {
                None => break,
                Some(ProxyCtl::Attach { id, queue }) => {
                    downstreams.insert(id, Downstream { queue, stalled_since: None });
                }
                Some(ProxyCtl::Detach { id }) => {
                    downstreams.remove(&id);
                    id_map.retain(|_, (owner, _)| *owner != id);
                }
                Some(ProxyCtl::FromDownstream { id, payload }) => {
                    next_upstream_id += 1;
                    let (payload, mapping) = remap_outgoing(&payload, next_upstream_id);
                    if let Some((key, original)) = mapping {
                        id_map.insert(key, (id, original));
                    }
                    if session.send_raw(WireFrame::text(payload)).await.is_err() {
                        tracing::debug!("upstream session closed, dropping proxy frame");
                    }
                }
            },
            frame = tap.recv() => match frame {
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("proxy tap lagged by {n} frames");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Ok(frame) => {
                    route_upstream(&frame.payload, &mut downstreams, &mut id_map);
                }
            },
            _ = stall_tick.tick() => {
                evict_stalled(&mut downstreams, &mut id_map);
            }
        }
    }
    tracing::debug!("proxy control plane stopped");
}

/// Rewrite the request id in a downstream frame.
///
/// Handles both wire shapes: `Data.RequestID` (WebSocket dialect, hex
/// string) and a root `id` (CC2 shape, integer). Frames without a
/// recognizable id pass through untouched.
fn remap_outgoing(payload: &str, upstream_id: u64) -> (String, Option<(String, Value)>) {
    let Ok(mut value) = serde_json::from_str::<Value>(payload) else {
        return (payload.to_string(), None);
    };

    if let Some(request_id) = value.pointer("/Data/RequestID").cloned() {
        let wire = format!("{upstream_id:016x}");
        if let Some(slot) = value.pointer_mut("/Data/RequestID") {
            *slot = Value::String(wire.clone());
        }
        return (value.to_string(), Some((wire, request_id)));
    }

    if let Some(request_id) = value.get("id").cloned().filter(|v| v.is_number()) {
        if let Some(slot) = value.get_mut("id") {
            *slot = Value::from(upstream_id);
        }
        return (value.to_string(), Some((upstream_id.to_string(), request_id)));
    }

    (payload.to_string(), None)
}

/// Route one upstream frame: mapped responses go to their owner with the
/// original id restored; everything else broadcasts unmodified.
fn route_upstream(
    payload: &str,
    downstreams: &mut HashMap<u64, Downstream>,
    id_map: &mut HashMap<String, (u64, Value)>,
) {
    if let Some((owner, restored)) = restore_response(payload, id_map) {
        if let Some(downstream) = downstreams.get_mut(&owner) {
            deliver(downstream, restored);
        }
        return;
    }
    for downstream in downstreams.values_mut() {
        deliver(downstream, payload.to_string());
    }
}

/// If this frame answers a remapped request, restore the original id and
/// name the owning downstream.
fn restore_response(
    payload: &str,
    id_map: &mut HashMap<String, (u64, Value)>,
) -> Option<(u64, String)> {
    let mut value = serde_json::from_str::<Value>(payload).ok()?;

    let key = if let Some(wire) = value.pointer("/Data/RequestID").and_then(Value::as_str) {
        wire.to_string()
    } else if let Some(id) = value.get("id").and_then(Value::as_u64) {
        id.to_string()
    } else {
        return None;
    };

    let (owner, original) = id_map.remove(&key)?;
    if let Some(slot) = value.pointer_mut("/Data/RequestID") {
        *slot = original;
    } else if let Some(slot) = value.get_mut("id") {
        *slot = original;
    }
    Some((owner, value.to_string()))
}

fn deliver(downstream: &mut Downstream, payload: String) {
    match downstream.queue.try_send(payload) {
        Ok(()) => downstream.stalled_since = None,
        Err(mpsc::error::TrySendError::Full(_)) => {
            // First stall starts the clock; the eviction sweep does the rest.
            downstream.stalled_since.get_or_insert_with(Instant::now);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

fn evict_stalled(
    downstreams: &mut HashMap<u64, Downstream>,
    id_map: &mut HashMap<String, (u64, Value)>,
) {
    let now = Instant::now();
    let stalled: Vec<u64> = downstreams
        .iter()
        .filter(|(_, d)| {
            d.stalled_since
                .is_some_and(|since| now.duration_since(since) > STALL_LIMIT)
        })
        .map(|(id, _)| *id)
        .collect();
    for id in stalled {
        tracing::warn!("evicting slow proxy consumer {id}");
        // Dropping the queue sender makes the writer emit the SlowConsumer
        // close frame.
        downstreams.remove(&id);
        id_map.retain(|_, (owner, _)| *owner != id);
    }
}
