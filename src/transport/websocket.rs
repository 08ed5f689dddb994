//! Plain WebSocket transport to `ws://<ip>:3030/websocket`.
//!
//! All SDCP traffic is text JSON; binary frames are rejected here so the
//! layers above never see them.

use std::net::IpAddr;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Transport, TransportRx, TransportTx, WireFrame};
use crate::error::{ElegooError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default SDCP WebSocket port on the printer.
pub const WEBSOCKET_PORT: u16 = 3030;

pub struct WebSocketTransport {
    url: String,
    stream: Option<WsStream>,
}

impl WebSocketTransport {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            url: format!("ws://{ip}:{port}/websocket"),
            stream: None,
        }
    }

    /// Transport pointed at an explicit URL (used when riding the proxy).
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self) -> Result<()> {
        let (ws, _response) = connect_async(&self.url)
            .await
            .map_err(|e| ElegooError::TransportReset(format!("ws connect {}: {e}", self.url)))?;
        self.stream = Some(ws);
        tracing::debug!("websocket open: {}", self.url);
        Ok(())
    }

    fn split(self: Box<Self>) -> Result<(Box<dyn TransportTx>, Box<dyn TransportRx>)> {
        let stream = self
            .stream
            .ok_or_else(|| ElegooError::TransportReset("websocket not open".into()))?;
        let (sink, stream) = stream.split();
        Ok((Box::new(WsTx { sink }), Box::new(WsRx { stream })))
    }
}

pub struct WsTx {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportTx for WsTx {
    async fn send(&mut self, frame: WireFrame) -> Result<()> {
        self.sink
            .send(Message::Text(frame.payload.into()))
            .await
            .map_err(|e| ElegooError::TransportReset(format!("ws send: {e}")))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

pub struct WsRx {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportRx for WsRx {
    async fn recv(&mut self) -> Option<WireFrame> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(WireFrame::text(text.to_string()));
                }
                Some(Ok(Message::Binary(_))) => {
                    // SDCP is text-only; drop and keep reading.
                    tracing::debug!("dropping unexpected binary websocket frame");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("websocket read error: {e}");
                    return None;
                }
            }
        }
    }
}
