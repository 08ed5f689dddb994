//! Transport abstraction: a bidirectional frame channel with reconnect.
//!
//! A [`Transport`] is opened once and then split into send and receive
//! halves. The receive half is driven by the session's reader pump; the send
//! half stays with the session actor, which is the only writer. That split is
//! what lets the actor keep single ownership of its state without locks.

pub mod broker;
pub mod mqtt;
pub mod websocket;

pub use broker::EmbeddedBroker;
pub use mqtt::{MqttMode, MqttTransport, CC2_DEFAULT_PASSWORD};
pub use websocket::WebSocketTransport;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::Result;

/// One message on the wire. MQTT transports route by `topic`; the WebSocket
/// transport carries routing inside the payload and leaves it `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub topic: Option<String>,
    pub payload: String,
}

impl WireFrame {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            topic: None,
            payload: payload.into(),
        }
    }

    pub fn topic(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            payload: payload.into(),
        }
    }
}

/// An unopened or freshly opened connection.
#[async_trait]
pub trait Transport: Send {
    /// Block until the first bytes are exchanged, or fail.
    async fn open(&mut self) -> Result<()>;

    /// Consume the opened transport into its two halves. Fails if the
    /// transport was never opened.
    fn split(self: Box<Self>) -> Result<(Box<dyn TransportTx>, Box<dyn TransportRx>)>;
}

/// Outbound half: sends, subscriptions, close.
#[async_trait]
pub trait TransportTx: Send {
    /// Queue a frame for delivery. Resolution means delivery to the socket,
    /// not a response.
    async fn send(&mut self, frame: WireFrame) -> Result<()>;

    /// Subscribe to a routing key. No-op on transports without topics.
    async fn subscribe(&mut self, _topic: &str) -> Result<()> {
        Ok(())
    }

    /// Idempotent close, releasing OS resources.
    async fn close(&mut self);
}

/// Inbound half: a stream of frames.
#[async_trait]
pub trait TransportRx: Send {
    /// Next inbound frame; `None` means the transport is closed.
    async fn recv(&mut self) -> Option<WireFrame>;
}

/// Builds a fresh transport for each connection attempt.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

/// Exponential backoff with jitter: `min(cap, base * 2^attempt) * (1 ± 0.2)`.
///
/// Attempts reset once the caller has been stable for 60 s.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            attempt: 0,
        }
    }

    /// Delay for the current attempt, advancing the counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(self.attempt.min(16) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64(capped * jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = Backoff::new();
        let first = b.next_delay();
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));
        for _ in 0..10 {
            b.next_delay();
        }
        let late = b.next_delay();
        assert!(late <= Duration::from_secs(36));
        assert!(late >= Duration::from_secs(24));
    }

    #[test]
    fn backoff_resets() {
        let mut b = Backoff::new();
        for _ in 0..5 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.attempt(), 0);
        let d = b.next_delay();
        assert!(d <= Duration::from_millis(1200));
    }
}
