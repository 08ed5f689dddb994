//! Embedded MQTT broker for legacy (host-broker) printers.
//!
//! CC1-era firmware cannot host a broker. We run one locally and steer the
//! printer to it with the discovery-phase `M66666` directive. Older firmware
//! ignores repeated redirects inside a minute, so the directive is sent from
//! discovery refresh only, never from the reconnect path.

use std::net::IpAddr;
use std::thread::JoinHandle;

use tokio::net::UdpSocket;

use crate::error::{ElegooError, Result};

/// UDP port legacy printers listen on for discovery-phase directives.
const DIRECTIVE_PORT: u16 = 3000;

/// A broker bound to a local port for the printer to connect to.
pub struct EmbeddedBroker {
    port: u16,
    thread: Option<JoinHandle<()>>,
}

impl EmbeddedBroker {
    /// Start the broker on `port`. The broker thread runs until process
    /// exit; starting twice on the same port fails with an IO error from the
    /// listener, surfaced as a transport error.
    pub fn start(port: u16) -> Result<Self> {
        let raw = format!(
            r#"
id = 0

[router]
id = 0
max_connections = 64
max_outgoing_packet_count = 200
max_segment_size = 104857600
max_segment_count = 10

[v4.printer]
name = "printer"
listen = "0.0.0.0:{port}"
next_connection_delay_ms = 1

[v4.printer.connections]
connection_timeout_ms = 60000
max_payload_size = 262144
max_inflight_count = 100
dynamic_filters = true
"#
        );
        let config: rumqttd::Config = toml::from_str(&raw)
            .map_err(|e| ElegooError::Config(format!("broker config: {e}")))?;
        let mut broker = rumqttd::Broker::new(config);
        let thread = std::thread::Builder::new()
            .name(format!("mqtt-broker-{port}"))
            .spawn(move || {
                if let Err(e) = broker.start() {
                    tracing::error!("embedded mqtt broker stopped: {e}");
                }
            })
            .map_err(ElegooError::Io)?;
        tracing::info!("embedded mqtt broker listening on :{port}");
        Ok(Self {
            port,
            thread: Some(thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send the `M66666` redirect so the printer connects to our broker.
    ///
    /// Called from discovery refresh. `host_ip` is the address the printer
    /// can reach us on. Firmware tokenizes the directive on whitespace
    /// (`M66666 <host> <port>`); a two-token form is read as port-only.
    pub async fn send_redirect(&self, printer_ip: IpAddr, host_ip: IpAddr) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let directive = format!("M66666 {host_ip} {}", self.port);
        socket
            .send_to(directive.as_bytes(), (printer_ip, DIRECTIVE_PORT))
            .await?;
        tracing::debug!("sent broker redirect to {printer_ip}: {directive}");
        Ok(())
    }
}

/// The local address the printer can reach us on, found by opening a UDP
/// socket toward it. No traffic is sent.
pub async fn local_ip_for(printer_ip: IpAddr) -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((printer_ip, 1)).await?;
    Ok(socket.local_addr()?.ip())
}

impl Drop for EmbeddedBroker {
    fn drop(&mut self) {
        // rumqttd has no shutdown handle; the listener thread is detached and
        // dies with the process. Port reuse within one process is avoided by
        // keeping a single broker per configured device.
        if let Some(thread) = self.thread.take() {
            drop(thread);
        }
    }
}
