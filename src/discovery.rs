//! UDP printer discovery, both dialects probed concurrently.
//!
//! Legacy printers answer the ASCII `M99999` probe on :3000 with a
//! `Data.Attributes` envelope; CC2 machines answer `{"id":0,"method":7000}`
//! on :52700 with a `result` object. Results are deduplicated by serial and
//! partial results are returned on timeout rather than an error.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::{ElegooError, Result};
use crate::model::{infer_capabilities, infer_family, Capability, Identity, ProtocolKind};
use crate::transport::broker;

pub const LEGACY_DISCOVERY_PORT: u16 = 3000;
pub const CC2_DISCOVERY_PORT: u16 = 52700;
pub const LEGACY_PROBE: &str = "M99999";
pub const CC2_PROBE: &str = r#"{"id":0,"method":7000}"#;

/// Broadcast probes wait this long; directed probes are cut to 3 s.
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(10);
const DIRECTED_TIMEOUT: Duration = Duration::from_secs(3);
/// Empty CC2 broadcasts are re-sent this many extra times.
const CC2_RETRIES: u32 = 2;

/// Locate printers on the local network.
///
/// `network_hint` narrows the probe to one address (directed mode); without
/// it both dialects broadcast. An empty result is not an error here — the
/// client façade decides whether that is fatal.
pub async fn discover(timeout: Duration, network_hint: Option<IpAddr>) -> Result<Vec<Identity>> {
    let cap = if network_hint.is_some() {
        DIRECTED_TIMEOUT
    } else {
        BROADCAST_TIMEOUT
    };
    let timeout = timeout.min(cap);

    let (legacy, cc2) = tokio::join!(
        probe_legacy(timeout, network_hint),
        probe_cc2(timeout, network_hint),
    );

    let mut seen = BTreeSet::new();
    let mut found = Vec::new();
    for identity in legacy
        .unwrap_or_default()
        .into_iter()
        .chain(cc2.unwrap_or_default())
    {
        if !seen.insert(identity.serial.clone()) {
            continue;
        }
        // A running proxy on this host answers the legacy probe too; drop
        // the reply that is just us advertising ourselves.
        if is_own_proxy_reply(&identity).await {
            tracing::debug!("ignoring own proxy advertisement at {}", identity.ip_address);
            continue;
        }
        found.push(identity);
    }
    tracing::info!("discovery finished: {} printer(s)", found.len());
    Ok(found)
}

/// A legacy reply from our own address whose name reads like a proxy
/// placeholder ("Proxy", or "None" from an unconfigured slot) is this host's
/// proxy, not a printer.
async fn is_own_proxy_reply(identity: &Identity) -> bool {
    if identity.protocol != ProtocolKind::WebsocketSdcp {
        return false;
    }
    if !(identity.name.contains("None") || identity.name.contains("Proxy")) {
        return false;
    }
    match broker::local_ip_for(identity.ip_address).await {
        Ok(local) => local == identity.ip_address,
        Err(_) => false,
    }
}

/// Like [`discover`], but an empty answer is an error.
pub async fn discover_required(
    timeout: Duration,
    network_hint: Option<IpAddr>,
) -> Result<Vec<Identity>> {
    let found = discover(timeout, network_hint).await?;
    if found.is_empty() {
        return Err(ElegooError::DiscoveryEmpty);
    }
    Ok(found)
}

fn target_addr(hint: Option<IpAddr>, port: u16) -> (String, u16) {
    match hint {
        Some(ip) => (ip.to_string(), port),
        None => ("255.255.255.255".to_string(), port),
    }
}

async fn probe_legacy(timeout: Duration, hint: Option<IpAddr>) -> Result<Vec<Identity>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let (host, port) = target_addr(hint, LEGACY_DISCOVERY_PORT);
    socket
        .send_to(LEGACY_PROBE.as_bytes(), (host.as_str(), port))
        .await?;

    collect_replies(&socket, timeout, parse_legacy_reply).await
}

async fn probe_cc2(timeout: Duration, hint: Option<IpAddr>) -> Result<Vec<Identity>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let (host, port) = target_addr(hint, CC2_DISCOVERY_PORT);

    let retries = if hint.is_none() { CC2_RETRIES } else { 0 };
    let per_attempt = timeout / (retries + 1);
    let mut found = Vec::new();
    for attempt in 0..=retries {
        socket
            .send_to(CC2_PROBE.as_bytes(), (host.as_str(), port))
            .await?;
        found = collect_replies(&socket, per_attempt, parse_cc2_reply).await?;
        if !found.is_empty() {
            break;
        }
        if attempt < retries {
            tracing::debug!("cc2 discovery retry {}", attempt + 1);
        }
    }
    Ok(found)
}

async fn collect_replies(
    socket: &UdpSocket,
    timeout: Duration,
    parse: fn(&str, IpAddr) -> Option<Identity>,
) -> Result<Vec<Identity>> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 8192];
    let mut found = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                    tracing::debug!("non-utf8 discovery reply from {addr}");
                    continue;
                };
                if let Some(identity) = parse(text, addr.ip()) {
                    tracing::info!(
                        "discovered {} ({}) at {}",
                        identity.name,
                        identity.model,
                        identity.ip_address
                    );
                    found.push(identity);
                }
            }
            Ok(Err(e)) => return Err(ElegooError::Io(e)),
            Err(_) => break, // window elapsed; return what we have
        }
    }
    Ok(found)
}

/// Parse a legacy discovery reply.
pub fn parse_legacy_reply(text: &str, sender: IpAddr) -> Option<Identity> {
    let value: Value = serde_json::from_str(text).ok()?;
    let data = value.get("Data")?;
    // Newer firmware nests the fields under Attributes, older inlines them.
    let attrs = data.get("Attributes").unwrap_or(data);

    let serial = attrs.get("MainboardID")?.as_str()?.to_string();
    let model = attrs
        .get("MachineName")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let ip_address = attrs
        .get("MainboardIP")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(sender);

    Some(Identity {
        name: attrs
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or(&model)
            .to_string(),
        family: infer_family(&model),
        capabilities: infer_capabilities(&model, ProtocolKind::WebsocketSdcp),
        serial,
        ip_address,
        firmware: attrs
            .get("FirmwareVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        protocol_version: attrs
            .get("ProtocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        protocol: ProtocolKind::WebsocketSdcp,
        model,
    })
}

/// Parse a CC2 discovery reply. `lan_status == 0` tags the printer
/// `cloud-only`; the client refuses to open sessions against those.
pub fn parse_cc2_reply(text: &str, sender: IpAddr) -> Option<Identity> {
    let value: Value = serde_json::from_str(text).ok()?;
    let result = value.get("result")?;

    let serial = result.get("sn")?.as_str()?.to_string();
    let model = result
        .get("machine_model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut capabilities = infer_capabilities(&model, ProtocolKind::MqttCc2);
    if result.get("lan_status").and_then(Value::as_i64).unwrap_or(0) == 0 {
        capabilities.insert(Capability::CloudOnly);
    }

    Some(Identity {
        name: result
            .get("host_name")
            .and_then(Value::as_str)
            .unwrap_or(&model)
            .to_string(),
        family: infer_family(&model),
        serial,
        ip_address: sender,
        firmware: result
            .get("firmware_version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        protocol_version: result
            .get("protocol_version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        protocol: ProtocolKind::MqttCc2,
        capabilities,
        model,
    })
}

/// Whether a CC2 discovery reply says the access code is required.
pub fn requires_access_code(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.pointer("/result/token_status").and_then(Value::as_i64))
        .unwrap_or(0)
        == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PrinterFamily;

    #[test]
    fn legacy_reply_parses() {
        let reply = r#"{
            "Id": "conn-1",
            "Data": {
                "Attributes": {
                    "Name": "My Saturn",
                    "MachineName": "Saturn 4 Ultra",
                    "MainboardIP": "192.168.1.44",
                    "MainboardID": "ABC",
                    "ProtocolVersion": "V3.0.0",
                    "FirmwareVersion": "V1.2.3"
                }
            }
        }"#;
        let id = parse_legacy_reply(reply, "192.168.1.99".parse().unwrap()).unwrap();
        assert_eq!(id.serial, "ABC");
        assert_eq!(id.name, "My Saturn");
        assert_eq!(id.ip_address.to_string(), "192.168.1.44");
        assert_eq!(id.protocol, ProtocolKind::WebsocketSdcp);
        assert_eq!(id.family, PrinterFamily::Resin);
    }

    #[test]
    fn legacy_reply_without_attributes_nesting() {
        let reply = r#"{
            "Data": {
                "Name": "Neptune",
                "MachineName": "Neptune 4",
                "MainboardID": "N4001"
            }
        }"#;
        let id = parse_legacy_reply(reply, "10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(id.serial, "N4001");
        assert_eq!(id.ip_address.to_string(), "10.0.0.5");
        assert_eq!(id.family, PrinterFamily::Fdm);
    }

    #[test]
    fn cc2_reply_parses_and_flags_cloud_mode() {
        let lan = r#"{"id":0,"result":{"host_name":"CC2","machine_model":"Centauri Carbon 2","sn":"CC2XYZ","token_status":1,"lan_status":1}}"#;
        let id = parse_cc2_reply(lan, "192.168.1.50".parse().unwrap()).unwrap();
        assert_eq!(id.serial, "CC2XYZ");
        assert_eq!(id.protocol, ProtocolKind::MqttCc2);
        assert!(id.is_connectable());
        assert!(requires_access_code(lan));

        let cloud = r#"{"id":0,"result":{"host_name":"CC2","machine_model":"Centauri Carbon 2","sn":"CC2CLOUD","token_status":0,"lan_status":0}}"#;
        let id = parse_cc2_reply(cloud, "192.168.1.51".parse().unwrap()).unwrap();
        assert!(id.capabilities.contains(&Capability::CloudOnly));
        assert!(!id.is_connectable());
        assert!(!requires_access_code(cloud));
    }

    #[tokio::test]
    async fn own_proxy_advertisement_is_filtered() {
        // Loopback is always a local address, so a proxy-named reply from it
        // is recognized as our own advertisement.
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let own = parse_legacy_reply(
            r#"{"Data": {"Name": "Elegoo Proxy", "MachineName": "Proxy", "MainboardID": "PRX1"}}"#,
            local,
        )
        .unwrap();
        assert!(is_own_proxy_reply(&own).await);

        // A real printer at the same address (name gives no proxy hint) and
        // a proxy-named reply from a remote address both survive.
        let mut printer = own.clone();
        printer.name = "Saturn 4 Ultra".into();
        assert!(!is_own_proxy_reply(&printer).await);

        let mut remote = own.clone();
        remote.ip_address = "203.0.113.9".parse().unwrap();
        assert!(!is_own_proxy_reply(&remote).await);

        // CC2 replies never match; the filter is a legacy-dialect concern.
        let mut cc2 = own.clone();
        cc2.protocol = ProtocolKind::MqttCc2;
        assert!(!is_own_proxy_reply(&cc2).await);
    }

    #[test]
    fn junk_replies_are_ignored() {
        assert!(parse_legacy_reply("not json", "10.0.0.1".parse().unwrap()).is_none());
        assert!(parse_cc2_reply(r#"{"no_result": true}"#, "10.0.0.1".parse().unwrap()).is_none());
    }
}
