//! Local proxy server: multiplexes downstream tools onto one upstream
//! printer connection.
//!
//! Printers accept roughly four concurrent connections. The proxy occupies
//! one and fans it out: a WebSocket control plane that remaps request ids,
//! and an HTTP video plane that shares a single MJPEG stream. With the proxy
//! enabled, the host integration itself connects to `localhost` and leaves
//! the printer's remaining slots free for slicers and monitoring tools.

pub mod video;
pub mod ws;

use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::session::SessionHandle;

/// A running proxy pair. Dropping the handle leaves the tasks running; call
/// [`ProxyServer::stop`] for an orderly shutdown.
pub struct ProxyServer {
    tasks: Vec<JoinHandle<()>>,
    ws_port: u16,
    video_port: u16,
}

impl ProxyServer {
    /// Start both planes against an open session.
    pub async fn start(session: SessionHandle, config: &ConnectionConfig) -> Result<Self> {
        let (mut tasks, ws_port) = ws::start(session, config.proxy_ws_port).await?;

        let mut video_port = config.proxy_video_port;
        if let Some(upstream_url) = config.identity.video_url() {
            let (video_tasks, bound) = video::start(upstream_url, config.proxy_video_port).await?;
            tasks.extend(video_tasks);
            video_port = bound;
        } else {
            tracing::debug!(
                "{} has no camera; video plane not started",
                config.identity.name
            );
        }

        Ok(Self {
            tasks,
            ws_port,
            video_port,
        })
    }

    /// WebSocket endpoint downstream clients connect to.
    pub fn ws_port(&self) -> u16 {
        self.ws_port
    }

    /// HTTP endpoint serving the shared MJPEG stream.
    pub fn video_port(&self) -> u16 {
        self.video_port
    }

    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
        tracing::info!("proxy stopped");
    }
}
