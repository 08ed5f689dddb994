//! MQTT transport, in two broker topologies.
//!
//! Printer-broker mode (CC2): the printer hosts the broker on :1883 and we
//! connect to it as an MQTT 3.1.1 client. Host-broker mode (legacy): we run
//! an embedded broker and connect to it over loopback; the printer is
//! redirected to us during discovery.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};

use super::{Transport, TransportRx, TransportTx, WireFrame};
use crate::error::{ElegooError, Result};

/// Broker port on CC2 printers and for the embedded legacy broker.
pub const MQTT_PORT: u16 = 1883;
/// Default CC2 broker credentials; the access code replaces the password when
/// the printer reports `token_status == 1`.
pub const CC2_USERNAME: &str = "elegoo";
pub const CC2_DEFAULT_PASSWORD: &str = "123456";

const KEEPALIVE: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Which end hosts the broker.
#[derive(Debug, Clone)]
pub enum MqttMode {
    /// Connect to the printer's own broker (CC2).
    PrinterBroker {
        host: String,
        client_id: String,
        password: String,
    },
    /// Connect to our embedded broker over loopback (legacy printers).
    HostBroker { port: u16, client_id: String },
}

pub struct MqttTransport {
    mode: MqttMode,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
}

impl MqttTransport {
    pub fn new(mode: MqttMode) -> Self {
        Self {
            mode,
            client: None,
            event_loop: None,
        }
    }

    fn options(&self) -> MqttOptions {
        match &self.mode {
            MqttMode::PrinterBroker {
                host,
                client_id,
                password,
            } => {
                let mut opts = MqttOptions::new(client_id.clone(), host.clone(), MQTT_PORT);
                opts.set_credentials(CC2_USERNAME, password.clone());
                opts.set_keep_alive(KEEPALIVE);
                opts.set_clean_session(true);
                opts
            }
            MqttMode::HostBroker { port, client_id } => {
                let mut opts = MqttOptions::new(client_id.clone(), "127.0.0.1", *port);
                opts.set_keep_alive(KEEPALIVE);
                opts.set_clean_session(true);
                opts
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn open(&mut self) -> Result<()> {
        let (client, mut event_loop) = AsyncClient::new(self.options(), 64);

        // Drive the event loop until the broker acknowledges the connection.
        let start = std::time::Instant::now();
        loop {
            if start.elapsed() > CONNECT_TIMEOUT {
                return Err(ElegooError::TransportReset("mqtt connect timeout".into()));
            }
            match tokio::time::timeout(Duration::from_millis(500), event_loop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    return Err(ElegooError::TransportReset(format!("mqtt connect: {e}")));
                }
                Err(_) => continue,
            }
        }

        self.client = Some(client);
        self.event_loop = Some(event_loop);
        tracing::debug!("mqtt open: {:?}", self.mode);
        Ok(())
    }

    fn split(self: Box<Self>) -> Result<(Box<dyn TransportTx>, Box<dyn TransportRx>)> {
        match (self.client, self.event_loop) {
            (Some(client), Some(event_loop)) => Ok((
                Box::new(MqttTx { client }),
                Box::new(MqttRx { event_loop }),
            )),
            _ => Err(ElegooError::TransportReset("mqtt not open".into())),
        }
    }
}

pub struct MqttTx {
    client: AsyncClient,
}

#[async_trait]
impl TransportTx for MqttTx {
    async fn send(&mut self, frame: WireFrame) -> Result<()> {
        let topic = frame
            .topic
            .ok_or_else(|| ElegooError::ProtocolError("mqtt frame without topic".into()))?;
        self.client
            .publish(topic, QoS::AtMostOnce, false, frame.payload)
            .await
            .map_err(|e| ElegooError::TransportReset(format!("mqtt publish: {e}")))
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| ElegooError::TransportReset(format!("mqtt subscribe {topic}: {e}")))
    }

    async fn close(&mut self) {
        let _ = self.client.disconnect().await;
    }
}

pub struct MqttRx {
    event_loop: EventLoop,
}

#[async_trait]
impl TransportRx for MqttRx {
    async fn recv(&mut self) -> Option<WireFrame> {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = match String::from_utf8(publish.payload.to_vec()) {
                        Ok(p) => p,
                        Err(_) => {
                            tracing::debug!("dropping non-utf8 mqtt payload on {}", publish.topic);
                            continue;
                        }
                    };
                    return Some(WireFrame {
                        topic: Some(publish.topic),
                        payload,
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("mqtt event loop error: {e}");
                    return None;
                }
            }
        }
    }
}
