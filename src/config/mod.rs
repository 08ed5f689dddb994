//! Configuration for the bridge daemon and per-printer connections.

use std::fs::File;
use std::io::Read;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ElegooError, Result};
use crate::model::Identity;
use crate::session::SessionConfig;

/// Top-level TOML configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub printer: PrinterSection,

    #[serde(default)]
    pub proxy: ProxySection,

    #[serde(default)]
    pub session: SessionSection,
}

/// Which printer to talk to, and how.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PrinterSection {
    /// Skip broadcast discovery and probe this address directly.
    #[serde(default)]
    pub ip_address: Option<String>,

    /// CC2 access code; replaces the default broker password when the
    /// printer requires a token.
    #[serde(default)]
    pub access_code: Option<String>,

    /// Hint only; detection from the model string stays authoritative.
    #[serde(default)]
    pub is_fdm: bool,
}

/// Local proxy endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_proxy_ws_port")]
    pub ws_port: u16,

    #[serde(default = "default_proxy_video_port")]
    pub video_port: u16,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            enabled: false,
            ws_port: default_proxy_ws_port(),
            video_port: default_proxy_video_port(),
        }
    }
}

/// Session cadence knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSection {
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    #[serde(default = "default_full_refresh")]
    pub full_refresh_secs: u64,

    #[serde(default = "default_degraded_grace")]
    pub degraded_grace_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval(),
            full_refresh_secs: default_full_refresh(),
            degraded_grace_secs: default_degraded_grace(),
        }
    }
}

fn default_proxy_ws_port() -> u16 {
    3030
}

fn default_proxy_video_port() -> u16 {
    3031
}

fn default_status_interval() -> u64 {
    2
}

fn default_full_refresh() -> u64 {
    300
}

fn default_degraded_grace() -> u64 {
    20
}

impl BridgeConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            safety_refresh: Duration::from_secs(self.session.full_refresh_secs),
            degraded_grace: Duration::from_secs(self.session.degraded_grace_secs),
            ..SessionConfig::default()
        }
    }
}

/// Load a TOML config file.
pub fn load_config(path: &str) -> Result<BridgeConfig> {
    let mut file = File::open(path)?;
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    toml::from_str(&raw).map_err(|e| ElegooError::Config(format!("{path}: {e}")))
}

/// `DEBUG=true` turns on verbose per-frame logging.
pub fn debug_enabled() -> bool {
    std::env::var("DEBUG")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Everything needed to open one printer client.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub identity: Identity,
    pub access_code: Option<String>,
    pub proxy_enabled: bool,
    pub proxy_ws_port: u16,
    pub proxy_video_port: u16,
    pub session: SessionConfig,
    pub status_interval: Duration,
}

impl ConnectionConfig {
    pub fn new(identity: Identity, bridge: &BridgeConfig) -> Self {
        Self {
            identity,
            access_code: bridge.printer.access_code.clone(),
            proxy_enabled: bridge.proxy.enabled,
            proxy_ws_port: bridge.proxy.ws_port,
            proxy_video_port: bridge.proxy.video_port,
            session: bridge.session_config(),
            status_interval: Duration::from_secs(bridge.session.status_interval_secs),
        }
    }
}
