//! Bridge daemon: discover a printer, keep a session open, optionally serve
//! the local proxy, and log status transitions until interrupted.

use std::env;
use std::time::Duration;

use elegoo_link::client::PrinterClient;
use elegoo_link::config::{self, ConnectionConfig};
use elegoo_link::discovery;
use elegoo_link::proxy::ProxyServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let level = if config::debug_enabled() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let args: Vec<String> = env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("elegoo-link.toml");

    tracing::info!("loading configuration from {config_path}");
    let bridge = match config::load_config(config_path) {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::warn!("{e}; continuing with defaults");
            Default::default()
        }
    };

    let hint = bridge
        .printer
        .ip_address
        .as_deref()
        .and_then(|ip| ip.parse().ok());
    let printers = discovery::discover_required(Duration::from_secs(10), hint).await?;
    for printer in &printers {
        tracing::info!(
            "found {} ({}, {:?}) at {}",
            printer.name,
            printer.model,
            printer.protocol,
            printer.ip_address
        );
    }
    let identity = printers.into_iter().next().expect("non-empty by contract");

    let config = ConnectionConfig::new(identity, &bridge);
    let proxy_enabled = config.proxy_enabled;
    let client = PrinterClient::open(config.clone()).await?;
    tracing::info!("connected to {}", client.identity().name);

    let proxy = if proxy_enabled {
        Some(ProxyServer::start(client.session().clone(), &config).await?)
    } else {
        None
    };

    let mut updates = client.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow().clone();
                tracing::info!(
                    "{:?} | {} layer {}/{} | nozzle {:.1}C bed {:.1}C{}",
                    snapshot.machine,
                    if snapshot.print.filename.is_empty() { "-" } else { &snapshot.print.filename },
                    snapshot.print.current_layer,
                    snapshot.print.total_layers,
                    snapshot.temps.nozzle,
                    snapshot.temps.bed,
                    if snapshot.stale { " (stale)" } else { "" },
                );
            }
        }
    }

    if let Some(proxy) = proxy {
        proxy.stop();
    }
    client.close().await;
    Ok(())
}
