//! LAN connectivity core for Elegoo resin and FDM printers.
//!
//! This crate discovers printers over UDP, speaks SDCP over WebSocket and
//! over MQTT (both the CC2's printer-hosted broker and the legacy
//! host-hosted broker), keeps long-lived sessions alive through heartbeats
//! and delta-status reconstruction, and can expose a local proxy that lets
//! several tools share the printer's few connection slots.
//!
//! # Example
//!
//! ```ignore
//! use elegoo_link::{discovery, client::PrinterClient, config::{BridgeConfig, ConnectionConfig}};
//! use std::time::Duration;
//!
//! let printers = discovery::discover_required(Duration::from_secs(5), None).await?;
//! let config = ConnectionConfig::new(printers[0].clone(), &BridgeConfig::default());
//! let client = PrinterClient::open(config).await?;
//! let snapshot = client.snapshot();
//! println!("{:?}: layer {}", snapshot.machine, snapshot.print.current_layer);
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod http;
pub mod model;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod transport;

pub use client::PrinterClient;
pub use config::{BridgeConfig, ConnectionConfig};
pub use error::{ElegooError, Result};
pub use model::{Attributes, Identity, PrinterFamily, ProtocolKind, StatusSnapshot};
pub use protocol::CommandKind;
pub use proxy::ProxyServer;
pub use session::{SessionHandle, SessionState};
