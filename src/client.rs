//! Unified printer client: identity + session + coordinator behind one
//! object, with typed commands and a subscribable snapshot stream.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::coordinator;
use crate::error::{ElegooError, Result};
use crate::http::AuxHttp;
use crate::model::{
    Attributes, Identity, PrintFileRecord, ProtocolKind, StatusSnapshot, StorageMedium, VideoAck,
    VideoFeed,
};
use crate::protocol::{cc2, CommandKind, Dialect, ResponseEnvelope};
use crate::session::{self, SessionHandle, SessionState};
use crate::transport::{
    broker, EmbeddedBroker, MqttMode, MqttTransport, Transport, TransportFactory,
    WebSocketTransport, CC2_DEFAULT_PASSWORD,
};

pub use crate::transport::websocket::WEBSOCKET_PORT;

/// One configured printer: session, refresh loop and auxiliary HTTP.
pub struct PrinterClient {
    identity: Identity,
    session: SessionHandle,
    coordinator: JoinHandle<()>,
    http: AuxHttp,
    /// Kept alive for legacy printers; they connect to this broker.
    _broker: Option<EmbeddedBroker>,
}

impl PrinterClient {
    /// Open a client against a discovered printer.
    ///
    /// Refuses cloud-mode CC2 machines with `UnsupportedMode`. Registration
    /// failures (`SlotExhausted`, `RegistrationFailed`) surface here; after a
    /// successful open, transport trouble is absorbed by the reconnect loop.
    pub async fn open(config: ConnectionConfig) -> Result<Self> {
        let identity = config.identity.clone();
        if !identity.is_connectable() {
            return Err(ElegooError::UnsupportedMode(format!(
                "{} is in cloud mode; enable LAN mode on the printer",
                identity.name
            )));
        }

        // Legacy printers need our broker up before they can be redirected
        // to it; redirection itself happens here, at the discovery phase,
        // never from the reconnect path.
        let mut embedded_broker = None;
        if identity.protocol == ProtocolKind::MqttLegacy {
            let broker_handle = EmbeddedBroker::start(crate::transport::mqtt::MQTT_PORT)?;
            let host_ip = broker::local_ip_for(identity.ip_address).await?;
            broker_handle
                .send_redirect(identity.ip_address, host_ip)
                .await?;
            embedded_broker = Some(broker_handle);
        }

        let (factory, dialect): (TransportFactory, Dialect) = match identity.protocol {
            ProtocolKind::WebsocketSdcp => {
                let ip = identity.ip_address;
                (
                    Box::new(move || {
                        Box::new(WebSocketTransport::new(ip, WEBSOCKET_PORT)) as Box<dyn Transport>
                    }),
                    Dialect::SdcpWs {
                        mainboard_id: identity.serial.clone(),
                    },
                )
            }
            ProtocolKind::MqttCc2 => {
                let client_id = cc2::generate_client_id();
                let host = identity.ip_address.to_string();
                let password = config
                    .access_code
                    .clone()
                    .unwrap_or_else(|| CC2_DEFAULT_PASSWORD.to_string());
                let mode = MqttMode::PrinterBroker {
                    host,
                    client_id: client_id.clone(),
                    password,
                };
                (
                    Box::new(move || Box::new(MqttTransport::new(mode.clone())) as Box<dyn Transport>),
                    Dialect::Cc2 {
                        serial: identity.serial.clone(),
                        client_id,
                    },
                )
            }
            ProtocolKind::MqttLegacy => {
                let client_id = format!("bridge{:04x}", rand::random::<u16>());
                let port = crate::transport::mqtt::MQTT_PORT;
                let mode = MqttMode::HostBroker { port, client_id };
                (
                    Box::new(move || Box::new(MqttTransport::new(mode.clone())) as Box<dyn Transport>),
                    Dialect::LegacyMqtt {
                        mainboard_id: identity.serial.clone(),
                    },
                )
            }
        };

        let fdm = identity.family == crate::model::PrinterFamily::Fdm;
        let (session, _join) =
            session::spawn(factory, dialect, fdm, config.session.clone()).await?;

        let coordinator = coordinator::spawn(
            session.clone(),
            identity.protocol,
            config.status_interval,
        );

        let http = AuxHttp::new(identity.ip_address, config.access_code.clone());

        Ok(Self {
            identity,
            session,
            coordinator,
            http,
            _broker: embedded_broker,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Copy of the current merged status.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.session.snapshot()
    }

    /// Latest-wins change stream; slow readers never build a backlog.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.session.subscribe()
    }

    pub fn attributes(&self) -> Attributes {
        self.session.attributes()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// The underlying session, for the proxy server.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Issue a typed command and wait for the printer's reply.
    pub async fn invoke(
        &self,
        kind: CommandKind,
        deadline: Option<Duration>,
    ) -> Result<ResponseEnvelope> {
        let (method, params) = kind.encode(self.identity.protocol)?;
        self.session.invoke(method, params, deadline).await
    }

    pub async fn pause_print(&self) -> Result<()> {
        self.invoke(CommandKind::PausePrint, None).await.map(|_| ())
    }

    pub async fn resume_print(&self) -> Result<()> {
        self.invoke(CommandKind::ResumePrint, None).await.map(|_| ())
    }

    pub async fn stop_print(&self) -> Result<()> {
        self.invoke(CommandKind::StopPrint, None).await.map(|_| ())
    }

    pub async fn set_light(&self, on: bool) -> Result<()> {
        self.invoke(CommandKind::SetLight { on, rgb: None }, None)
            .await
            .map(|_| ())
    }

    /// List printable files on the machine.
    pub async fn list_files(&self, path: &str) -> Result<Vec<PrintFileRecord>> {
        let resp = self
            .invoke(
                CommandKind::ListFiles {
                    path: path.to_string(),
                },
                None,
            )
            .await?;
        Ok(parse_file_list(&resp.result))
    }

    /// Toggle the camera stream and return its URL.
    pub async fn enable_video(&self, enable: bool) -> Result<VideoFeed> {
        let resp = self
            .invoke(CommandKind::EnableVideoStream { enable }, None)
            .await?;
        let ack = resp
            .result
            .get("Ack")
            .or_else(|| resp.result.get("error_code"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let mut url = resp
            .result
            .get("VideoUrl")
            .or_else(|| resp.result.get("video_url"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // CC2 reports success without a URL; the stream lives on :8080.
        if url.is_empty() && ack == 0 {
            url = self
                .identity
                .video_url()
                .unwrap_or_else(|| format!("http://{}:8080/?action=stream", self.identity.ip_address));
        }
        Ok(VideoFeed {
            ack: VideoAck::from_code(ack),
            url,
        })
    }

    /// Fetch the thumbnail for a printable file.
    pub async fn fetch_thumbnail(&self, filename: &str) -> Result<Vec<u8>> {
        let resp = self
            .invoke(
                CommandKind::GetFileDetail {
                    filename: filename.to_string(),
                    storage: StorageMedium::Local,
                },
                None,
            )
            .await?;
        let url = resp
            .result
            .get("thumbnail")
            .or_else(|| resp.result.get("Thumbnail"))
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ElegooError::FileNotFound(filename.to_string()))?;
        self.http.fetch_bytes(url).await
    }

    /// Auxiliary HTTP interface (uploads, system info).
    pub fn http(&self) -> &AuxHttp {
        &self.http
    }

    /// Close the session and stop the refresh loop.
    pub async fn close(self) {
        self.session.close().await;
        self.coordinator.abort();
    }
}

/// Parse a file-list response tolerantly across dialects.
fn parse_file_list(result: &Value) -> Vec<PrintFileRecord> {
    let entries = result
        .get("file_list")
        .or_else(|| result.get("FileList"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    entries
        .iter()
        .filter_map(|entry| {
            let filename = entry
                .get("filename")
                .or_else(|| entry.get("name"))
                .or_else(|| entry.get("Name"))
                .and_then(Value::as_str)?
                .to_string();
            Some(PrintFileRecord {
                filename,
                storage: StorageMedium::Local,
                size: entry
                    .get("size")
                    .or_else(|| entry.get("usedSize"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                md5: entry
                    .get("md5")
                    .or_else(|| entry.get("MD5"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                total_layers: entry
                    .get("TotalLayers")
                    .or_else(|| entry.get("total_layer"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
                thumbnail: None,
            })
        })
        .collect()
}
