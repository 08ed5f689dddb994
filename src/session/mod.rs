//! The protocol session: registration, heartbeat, request matching, delta
//! merge and continuity tracking on top of a transport.
//!
//! The session runs as a single actor task that owns the transport's send
//! half, the in-flight table and the raw status tree. A reader pump drains
//! the receive half into a channel the actor selects on, so every piece of
//! state has exactly one writer. Callers talk to the actor through a
//! [`SessionHandle`] of channel endpoints.

pub mod merge;
pub mod state;

pub use state::SessionState;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{ElegooError, Result, WarnLimiter};
use crate::model::{Attributes, StatusSnapshot};
use crate::protocol::{
    cc2, cc2_methods, legacy_mqtt, CommandEnvelope, Dialect, InboundMessage, ResponseEnvelope,
};
use crate::transport::{Backoff, TransportFactory, TransportTx, WireFrame};

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Default `Invoke` deadline.
    pub invoke_timeout: Duration,
    /// How long to wait for the CC2 registration reply.
    pub registration_timeout: Duration,
    /// CC2 heartbeat PING cadence.
    pub heartbeat_interval: Duration,
    /// Missing PONGs for this long moves READY to DEGRADED.
    pub heartbeat_timeout: Duration,
    /// Extra time DEGRADED is tolerated before a forced reconnect.
    pub degraded_grace: Duration,
    /// Unconditional full-status refresh cadence.
    pub safety_refresh: Duration,
    /// Sequence mismatches tolerated before a forced full refresh.
    pub max_gap_events: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(65),
            degraded_grace: Duration::from_secs(20),
            safety_refresh: Duration::from_secs(300),
            max_gap_events: 5,
        }
    }
}

/// Requests the handle can make of the actor.
enum SessionRequest {
    Invoke {
        method: u32,
        params: Value,
        deadline: Duration,
        respond_to: oneshot::Sender<Result<ResponseEnvelope>>,
    },
    /// Pre-encoded frame from the proxy; sent verbatim.
    SendRaw { frame: WireFrame },
    Reconnect,
    Close,
}

/// Who is waiting on an in-flight request.
enum Waiter {
    External(oneshot::Sender<Result<ResponseEnvelope>>),
    /// Total-layer recovery query for a file.
    FileDetail { filename: String },
    /// Fire-and-track internal request (initial data, safety refresh).
    Internal,
}

struct InFlight {
    waiter: Waiter,
    deadline: Instant,
    method: u32,
}

/// Cheaply cloneable façade over a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionRequest>,
    snapshot_rx: watch::Receiver<StatusSnapshot>,
    attributes_rx: watch::Receiver<Attributes>,
    state_rx: watch::Receiver<SessionState>,
    tap_tx: broadcast::Sender<WireFrame>,
    invoke_timeout: Duration,
}

impl SessionHandle {
    /// Send a command and wait for its response or deadline.
    pub async fn invoke(
        &self,
        method: u32,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<ResponseEnvelope> {
        let (respond_to, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionRequest::Invoke {
                method,
                params,
                deadline: deadline.unwrap_or(self.invoke_timeout),
                respond_to,
            })
            .await
            .map_err(|_| ElegooError::SessionClosed)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ElegooError::SessionClosed),
        }
    }

    /// Push a pre-encoded frame upstream (proxy path).
    pub async fn send_raw(&self, frame: WireFrame) -> Result<()> {
        self.cmd_tx
            .send(SessionRequest::SendRaw { frame })
            .await
            .map_err(|_| ElegooError::SessionClosed)
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Latest-wins snapshot stream.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn attributes(&self) -> Attributes {
        self.attributes_rx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Every raw inbound frame, for the proxy fan-out.
    pub fn tap(&self) -> broadcast::Receiver<WireFrame> {
        self.tap_tx.subscribe()
    }

    /// Ask the actor to drop the transport and reconnect.
    pub async fn force_reconnect(&self) {
        let _ = self.cmd_tx.send(SessionRequest::Reconnect).await;
    }

    /// Close the session. Outstanding invokes resolve with `SessionClosed`.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(SessionRequest::Close).await;
    }
}

/// Spawn a session actor.
///
/// Returns once the first connection attempt (including CC2 registration)
/// has succeeded or failed, so `SlotExhausted` and friends surface to the
/// caller of `Open`. Later transport failures are absorbed into the
/// reconnect loop.
pub async fn spawn(
    factory: TransportFactory,
    dialect: Dialect,
    fdm: bool,
    config: SessionConfig,
) -> Result<(SessionHandle, JoinHandle<()>)> {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
    let (attributes_tx, attributes_rx) = watch::channel(Attributes::default());
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);
    let (tap_tx, _) = broadcast::channel(256);
    let (ready_tx, ready_rx) = oneshot::channel();

    let handle = SessionHandle {
        cmd_tx,
        snapshot_rx,
        attributes_rx,
        state_rx,
        tap_tx: tap_tx.clone(),
        invoke_timeout: config.invoke_timeout,
    };

    let actor = Session {
        factory,
        dialect,
        fdm,
        config,
        in_flight: HashMap::new(),
        // Leaves the low id range to the proxy's remapper, so tap consumers
        // can tell the two request streams apart.
        next_request_id: 1 << 24,
        cached_tree: Value::Null,
        last_update_id: 0,
        non_continuous: 0,
        snapshot_tx,
        attributes_tx,
        state_tx,
        tap_tx,
        last_pong: Instant::now(),
        ready_since: None,
        unknown_methods: HashSet::new(),
        pending_file_detail: None,
        warn: WarnLimiter::default(),
    };

    let join = tokio::spawn(actor.run(cmd_rx, ready_tx));
    match ready_rx.await {
        Ok(Ok(())) => Ok((handle, join)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ElegooError::SessionClosed),
    }
}

enum SweepOutcome {
    Continue,
    Reconnect,
}

struct Session {
    factory: TransportFactory,
    dialect: Dialect,
    fdm: bool,
    config: SessionConfig,
    in_flight: HashMap<u64, InFlight>,
    next_request_id: u64,
    cached_tree: Value,
    last_update_id: u64,
    non_continuous: u32,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    attributes_tx: watch::Sender<Attributes>,
    state_tx: watch::Sender<SessionState>,
    tap_tx: broadcast::Sender<WireFrame>,
    last_pong: Instant,
    ready_since: Option<Instant>,
    unknown_methods: HashSet<u32>,
    pending_file_detail: Option<String>,
    warn: WarnLimiter,
}

impl Session {
    fn is_cc2(&self) -> bool {
        matches!(self.dialect, Dialect::Cc2 { .. })
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current != state {
                tracing::debug!("session state: {current} -> {state}");
                *current = state;
                true
            } else {
                false
            }
        });
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionRequest>,
        ready_tx: oneshot::Sender<Result<()>>,
    ) {
        let mut first_attempt = Some(ready_tx);
        let mut backoff = Backoff::new();

        'supervisor: loop {
            self.set_state(SessionState::Connecting);
            let mut transport = (self.factory)();
            if let Err(e) = transport.open().await {
                if let Some(tx) = first_attempt.take() {
                    self.set_state(SessionState::Closed);
                    let _ = tx.send(Err(e));
                    return;
                }
                self.warn.warn(&e, "connect");
                self.set_state(SessionState::Reconnecting);
                tokio::time::sleep(backoff.next_delay()).await;
                continue 'supervisor;
            }

            let (mut tx, mut rx) = match transport.split() {
                Ok(halves) => halves,
                Err(e) => {
                    if let Some(txr) = first_attempt.take() {
                        self.set_state(SessionState::Closed);
                        let _ = txr.send(Err(e));
                        return;
                    }
                    continue 'supervisor;
                }
            };
            let (inbound_tx, mut inbound_rx) = mpsc::channel::<WireFrame>(64);
            let pump = tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if inbound_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            });

            if let Err(e) = self.establish(&mut tx, &mut inbound_rx).await {
                pump.abort();
                tx.close().await;
                if let Some(txr) = first_attempt.take() {
                    self.set_state(SessionState::Closed);
                    let _ = txr.send(Err(e));
                    return;
                }
                // "too many clients" has a mandated retry schedule.
                let delay = e.retry_after().unwrap_or_else(|| backoff.next_delay());
                self.warn.warn(&e, "session establish");
                self.set_state(SessionState::Reconnecting);
                tokio::time::sleep(delay).await;
                continue 'supervisor;
            }

            self.set_state(SessionState::Ready);
            self.ready_since = Some(Instant::now());
            self.last_pong = Instant::now();
            if let Some(txr) = first_attempt.take() {
                let _ = txr.send(Ok(()));
            }

            // Initial data: attributes once per connection, then the
            // authoritative full status.
            let _ = self
                .start_internal(&mut tx, self.dialect.attributes_method(), json!({}))
                .await;
            let _ = self
                .start_internal(&mut tx, self.dialect.status_method(), json!({}))
                .await;

            let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut sweep = tokio::time::interval(Duration::from_secs(1));
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_refresh = Instant::now();

            let reconnect = loop {
                tokio::select! {
                    req = cmd_rx.recv() => match req {
                        None | Some(SessionRequest::Close) => {
                            pump.abort();
                            self.shutdown(&mut tx).await;
                            return;
                        }
                        Some(SessionRequest::Reconnect) => break true,
                        Some(SessionRequest::SendRaw { frame }) => {
                            let mut frame = frame;
                            self.fill_topic(&mut frame);
                            if let Err(e) = tx.send(frame).await {
                                self.warn.warn(&e, "raw send");
                                break true;
                            }
                        }
                        Some(SessionRequest::Invoke { method, params, deadline, respond_to }) => {
                            if self.start_invoke(&mut tx, method, params, deadline, respond_to).await.is_err() {
                                break true;
                            }
                        }
                    },
                    inbound = inbound_rx.recv() => match inbound {
                        None => break true,
                        Some(frame) => {
                            if self.handle_frame(&mut tx, frame).await.is_err() {
                                break true;
                            }
                        }
                    },
                    _ = heartbeat.tick(), if self.is_cc2() => {
                        if self.send_ping(&mut tx).await.is_err() {
                            break true;
                        }
                    },
                    _ = sweep.tick() => {
                        match self.sweep(&mut tx, &mut last_refresh, &mut backoff).await {
                            SweepOutcome::Continue => {}
                            SweepOutcome::Reconnect => break true,
                        }
                    }
                }
            };

            pump.abort();
            tx.close().await;
            if reconnect {
                self.fail_in_flight(|| ElegooError::TransportReset("reconnecting".into()));
                self.mark_stale();
                self.set_state(SessionState::Reconnecting);
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }

    /// Registration plus topic subscriptions; runs before READY.
    async fn establish(
        &mut self,
        tx: &mut Box<dyn TransportTx>,
        inbound_rx: &mut mpsc::Receiver<WireFrame>,
    ) -> Result<()> {
        match self.dialect.clone() {
            Dialect::Cc2 { serial, client_id } => {
                self.set_state(SessionState::Registering);
                self.register(tx, inbound_rx, &serial, &client_id).await?;
                tx.subscribe(&cc2::status_topic(&serial)).await?;
                tx.subscribe(&cc2::response_topic(&serial, &client_id))
                    .await?;
            }
            Dialect::LegacyMqtt { mainboard_id } => {
                for topic in legacy_mqtt::subscription_topics(&mainboard_id) {
                    tx.subscribe(&topic).await?;
                }
            }
            Dialect::SdcpWs { .. } => {}
        }
        Ok(())
    }

    /// CC2 registration handshake. `"ok"` admits us; `"too many clients"`
    /// maps to `SlotExhausted`; anything else is `RegistrationFailed`.
    async fn register(
        &mut self,
        tx: &mut Box<dyn TransportTx>,
        inbound_rx: &mut mpsc::Receiver<WireFrame>,
        serial: &str,
        client_id: &str,
    ) -> Result<()> {
        let request_id = cc2::generate_register_request_id();
        tx.subscribe(&cc2::register_response_topic(serial, &request_id))
            .await?;
        tx.send(WireFrame::topic(
            cc2::register_topic(serial),
            cc2::register_payload(client_id, &request_id),
        ))
        .await?;

        let deadline = Instant::now() + self.config.registration_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ElegooError::RegistrationFailed("no reply within 3s".into()));
            }
            match tokio::time::timeout(remaining, inbound_rx.recv()).await {
                Ok(Some(frame)) => {
                    if let Ok(InboundMessage::RegisterReply { error }) =
                        self.dialect.decode_frame(&frame)
                    {
                        return match error.as_str() {
                            "ok" => {
                                tracing::info!("registered with printer as {client_id}");
                                Ok(())
                            }
                            "too many clients" => Err(ElegooError::SlotExhausted),
                            other => Err(ElegooError::RegistrationFailed(other.to_string())),
                        };
                    }
                    // Early status traffic before the reply is fine to apply.
                    let _ = self.handle_frame(tx, frame).await;
                }
                Ok(None) => {
                    return Err(ElegooError::TransportReset(
                        "transport closed during registration".into(),
                    ))
                }
                Err(_) => {
                    return Err(ElegooError::RegistrationFailed("no reply within 3s".into()))
                }
            }
        }
    }

    async fn send_ping(&mut self, tx: &mut Box<dyn TransportTx>) -> Result<()> {
        let Dialect::Cc2 { serial, client_id } = &self.dialect else {
            return Ok(());
        };
        // Fire-and-forget: the PONG is tracked by the sweep, never awaited.
        tx.send(WireFrame::topic(
            cc2::request_topic(serial, client_id),
            cc2::ping_payload(),
        ))
        .await
    }

    /// Raw frames from the proxy arrive without MQTT routing; give them the
    /// session's request topic.
    fn fill_topic(&self, frame: &mut WireFrame) {
        if frame.topic.is_some() {
            return;
        }
        match &self.dialect {
            Dialect::Cc2 { serial, client_id } => {
                frame.topic = Some(cc2::request_topic(serial, client_id));
            }
            Dialect::LegacyMqtt { mainboard_id } => {
                frame.topic = Some(legacy_mqtt::request_topic(mainboard_id));
            }
            Dialect::SdcpWs { .. } => {}
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    async fn start_invoke(
        &mut self,
        tx: &mut Box<dyn TransportTx>,
        method: u32,
        params: Value,
        deadline: Duration,
        respond_to: oneshot::Sender<Result<ResponseEnvelope>>,
    ) -> Result<()> {
        let request_id = self.next_id();
        let env = CommandEnvelope {
            request_id,
            method,
            params,
        };
        let frame = self.dialect.encode_command(&env);
        self.in_flight.insert(
            request_id,
            InFlight {
                waiter: Waiter::External(respond_to),
                deadline: Instant::now() + deadline,
                method,
            },
        );
        if let Err(e) = tx.send(frame).await {
            if let Some(entry) = self.in_flight.remove(&request_id) {
                if let Waiter::External(waiter) = entry.waiter {
                    let _ = waiter.send(Err(ElegooError::TransportReset(e.to_string())));
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn start_internal(&mut self, tx: &mut Box<dyn TransportTx>, method: u32, params: Value) -> Result<()> {
        self.start_tracked(tx, method, params, Waiter::Internal).await
    }

    async fn start_tracked(
        &mut self,
        tx: &mut Box<dyn TransportTx>,
        method: u32,
        params: Value,
        waiter: Waiter,
    ) -> Result<()> {
        let request_id = self.next_id();
        let env = CommandEnvelope {
            request_id,
            method,
            params,
        };
        let frame = self.dialect.encode_command(&env);
        self.in_flight.insert(
            request_id,
            InFlight {
                waiter,
                deadline: Instant::now() + self.config.invoke_timeout,
                method,
            },
        );
        tx.send(frame).await
    }

    async fn request_full_refresh(&mut self, tx: &mut Box<dyn TransportTx>) -> Result<()> {
        self.non_continuous = 0;
        let method = self.dialect.status_method();
        self.start_internal(tx, method, json!({})).await
    }

    async fn handle_frame(&mut self, tx: &mut Box<dyn TransportTx>, frame: WireFrame) -> Result<()> {
        // Proxy tap sees every inbound frame verbatim.
        let _ = self.tap_tx.send(frame.clone());

        let message = match self.dialect.decode_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                self.warn.warn(&e, "inbound frame");
                return Ok(());
            }
        };

        match message {
            InboundMessage::Pong => {
                self.last_pong = Instant::now();
                if *self.state_tx.borrow() == SessionState::Degraded {
                    self.set_state(SessionState::Ready);
                    self.ready_since = Some(Instant::now());
                }
            }
            InboundMessage::RegisterReply { .. } => {
                // Late duplicate after a completed handshake; nothing to do.
            }
            InboundMessage::Response(resp) => self.handle_response(tx, resp).await?,
            InboundMessage::Status {
                update_id,
                full,
                tree,
            } => {
                if full {
                    self.apply_full_status(tx, update_id, tree).await?;
                } else {
                    self.apply_delta_status(tx, update_id, tree).await?;
                }
            }
            InboundMessage::Attributes(tree) => self.apply_attributes(&tree),
            InboundMessage::Notice(value) => {
                tracing::debug!("printer notice: {value}");
            }
            InboundMessage::Unknown { method, raw } => {
                if let Some(code) = method {
                    if self.unknown_methods.insert(code) {
                        tracing::warn!("unknown inbound method {code}; merging payload anyway");
                    }
                    // Forward compat: unknown status events still carry a
                    // mergeable tree.
                    if let Some(result) = raw.get("result").filter(|r| r.is_object()) {
                        let update_id = result
                            .get("sequence")
                            .and_then(Value::as_u64)
                            .unwrap_or(self.last_update_id + 1);
                        self.apply_delta_status(tx, update_id, result.clone()).await?;
                    }
                } else {
                    tracing::debug!("unclassified frame: {raw}");
                }
            }
        }
        Ok(())
    }

    async fn handle_response(
        &mut self,
        tx: &mut Box<dyn TransportTx>,
        resp: ResponseEnvelope,
    ) -> Result<()> {
        // CC2 carries full status and attributes inside responses.
        if self.is_cc2() && resp.error_code == 0 {
            if resp.method == cc2_methods::GET_STATUS {
                let update_id = resp
                    .result
                    .get("sequence")
                    .and_then(Value::as_u64)
                    .unwrap_or(self.last_update_id);
                self.apply_full_status(tx, update_id, resp.result.clone())
                    .await?;
            } else if resp.method == cc2_methods::GET_ATTRIBUTES {
                let tree = resp.result.clone();
                self.apply_attributes(&tree);
            }
        }

        let Some(entry) = self.in_flight.remove(&resp.request_id) else {
            tracing::debug!(
                "orphan response: id={} method={}",
                resp.request_id,
                resp.method
            );
            return Ok(());
        };

        match entry.waiter {
            Waiter::External(waiter) => {
                let outcome = if resp.error_code != 0 {
                    Err(ElegooError::from_printer_code(
                        resp.error_code,
                        &format!("method {}", resp.method),
                    ))
                } else {
                    Ok(resp)
                };
                let _ = waiter.send(outcome);
            }
            Waiter::FileDetail { filename } => {
                self.pending_file_detail = None;
                if resp.error_code == 0 {
                    self.apply_file_detail(&filename, &resp.result);
                }
            }
            Waiter::Internal => {}
        }
        Ok(())
    }

    async fn apply_full_status(
        &mut self,
        tx: &mut Box<dyn TransportTx>,
        update_id: u64,
        tree: Value,
    ) -> Result<()> {
        // Authoritative replacement. The id is still monotonic: a printer
        // reboot restarts its counter, and max() keeps ours from regressing.
        self.cached_tree = tree;
        self.last_update_id = self.last_update_id.max(update_id);
        self.non_continuous = 0;
        self.rebuild_snapshot(tx).await
    }

    async fn apply_delta_status(
        &mut self,
        tx: &mut Box<dyn TransportTx>,
        update_id: u64,
        tree: Value,
    ) -> Result<()> {
        let expected = self.last_update_id + 1;
        if update_id != expected {
            self.non_continuous += 1;
            tracing::debug!(
                "non-continuous status: expected {expected}, got {update_id} (count {})",
                self.non_continuous
            );
            if self.non_continuous >= self.config.max_gap_events {
                self.request_full_refresh(tx).await?;
            }
        }
        self.last_update_id = self.last_update_id.max(update_id);

        if self.cached_tree.is_null() {
            self.cached_tree = Value::Object(serde_json::Map::new());
        }
        merge::deep_merge(&mut self.cached_tree, &tree);
        self.rebuild_snapshot(tx).await
    }

    async fn rebuild_snapshot(&mut self, tx: &mut Box<dyn TransportTx>) -> Result<()> {
        let snapshot = match self.dialect {
            Dialect::Cc2 { .. } => StatusSnapshot::from_cc2(&self.cached_tree, self.last_update_id),
            _ => StatusSnapshot::from_sdcp(&self.cached_tree, self.last_update_id, self.fdm),
        };

        // A tainted snapshot means the tree is internally inconsistent;
        // refetch rather than trusting the merge result.
        if snapshot.tainted {
            self.request_full_refresh(tx).await?;
        }

        // CC2 deltas routinely omit total_layer; recover it from the file
        // record, once per filename.
        if self.is_cc2()
            && snapshot.needs_layer_recovery()
            && self.pending_file_detail.as_deref() != Some(snapshot.print.filename.as_str())
        {
            let filename = snapshot.print.filename.clone();
            self.pending_file_detail = Some(filename.clone());
            self.start_tracked(
                tx,
                cc2_methods::GET_FILE_DETAIL,
                json!({ "storage_media": "local", "filename": filename.clone() }),
                Waiter::FileDetail { filename },
            )
            .await?;
        }

        self.snapshot_tx.send_if_modified(|current| {
            if *current != snapshot {
                *current = snapshot;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Fill `total_layer` from a file-detail response. Firmware has shipped
    /// the count as `TotalLayers`, `layer` and `total_layer`; take whichever
    /// is present.
    fn apply_file_detail(&mut self, filename: &str, result: &Value) {
        let layers = result
            .get("TotalLayers")
            .or_else(|| result.get("layer"))
            .or_else(|| result.get("total_layer"))
            .and_then(Value::as_u64);
        let Some(layers) = layers else {
            tracing::debug!("file detail for {filename} had no layer count");
            return;
        };
        for block in ["print_status", "print_job"] {
            if let Some(job) = self.cached_tree.get_mut(block) {
                if job.get("filename").and_then(Value::as_str) == Some(filename)
                    || job.get("file_name").and_then(Value::as_str) == Some(filename)
                {
                    if let Some(obj) = job.as_object_mut() {
                        obj.insert("total_layer".into(), json!(layers));
                    }
                }
            }
        }
        let update_id = self.last_update_id;
        let snapshot = StatusSnapshot::from_cc2(&self.cached_tree, update_id);
        self.snapshot_tx.send_if_modified(|current| {
            if *current != snapshot {
                *current = snapshot;
                true
            } else {
                false
            }
        });
    }

    fn apply_attributes(&mut self, tree: &Value) {
        let attrs = if self.is_cc2() {
            Attributes::from_cc2(tree)
        } else {
            Attributes::from_sdcp(tree)
        };
        self.attributes_tx.send_if_modified(|current| {
            if *current != attrs {
                *current = attrs;
                true
            } else {
                false
            }
        });
    }

    async fn sweep(
        &mut self,
        tx: &mut Box<dyn TransportTx>,
        last_refresh: &mut Instant,
        backoff: &mut Backoff,
    ) -> SweepOutcome {
        let now = Instant::now();

        // Expire in-flight requests past their deadline.
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = self.in_flight.remove(&id) {
                tracing::debug!("request {id} (method {}) timed out", entry.method);
                match entry.waiter {
                    Waiter::External(waiter) => {
                        let _ = waiter.send(Err(ElegooError::RequestTimeout {
                            method: entry.method,
                        }));
                    }
                    Waiter::FileDetail { .. } => {
                        self.pending_file_detail = None;
                    }
                    Waiter::Internal => {}
                }
            }
        }

        // Heartbeat ageing (CC2 only).
        if self.is_cc2() {
            let silent = now.duration_since(self.last_pong);
            let state = *self.state_tx.borrow();
            if silent > self.config.heartbeat_timeout + self.config.degraded_grace {
                self.warn.warn(
                    &ElegooError::TransportReset("heartbeat lost".into()),
                    "session",
                );
                return SweepOutcome::Reconnect;
            }
            if silent > self.config.heartbeat_timeout && state == SessionState::Ready {
                tracing::warn!(
                    "no heartbeat PONG for {}s, session degraded",
                    silent.as_secs()
                );
                self.set_state(SessionState::Degraded);
            }
        }

        // Safety net: full status every safety_refresh regardless of deltas.
        if now.duration_since(*last_refresh) >= self.config.safety_refresh {
            *last_refresh = now;
            if self.request_full_refresh(tx).await.is_err() {
                return SweepOutcome::Reconnect;
            }
        }

        // Stable for a minute: reconnect attempts start over at 1 s.
        if let Some(since) = self.ready_since {
            if *self.state_tx.borrow() == SessionState::Ready
                && now.duration_since(since) >= Duration::from_secs(60)
            {
                backoff.reset();
            }
        }

        SweepOutcome::Continue
    }

    fn fail_in_flight(&mut self, err: impl Fn() -> ElegooError) {
        for (_, entry) in self.in_flight.drain() {
            if let Waiter::External(waiter) = entry.waiter {
                let _ = waiter.send(Err(err()));
            }
        }
        self.pending_file_detail = None;
    }

    fn mark_stale(&self) {
        self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.stale {
                false
            } else {
                snapshot.stale = true;
                true
            }
        });
    }

    async fn shutdown(&mut self, tx: &mut Box<dyn TransportTx>) {
        self.fail_in_flight(|| ElegooError::SessionClosed);
        tx.close().await;
        self.set_state(SessionState::Closed);
        tracing::info!("session closed");
    }
}
