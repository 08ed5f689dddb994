//! Shared test harness: an in-memory transport the session can reconnect
//! through, with test-side handles to observe outbound frames and inject
//! inbound ones.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use elegoo_link::error::Result;
use elegoo_link::transport::{Transport, TransportFactory, TransportRx, TransportTx, WireFrame};

/// Test side of the mock wire.
pub struct MockWire {
    /// Frames the session sent.
    pub outbound: mpsc::Receiver<WireFrame>,
    /// Inject frames for the session to receive.
    pub inbound: broadcast::Sender<WireFrame>,
}

/// Build a factory whose transports all share one wire.
pub fn mock_wire() -> (TransportFactory, MockWire) {
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let (inbound_tx, _) = broadcast::channel(256);

    let inbound_for_factory = inbound_tx.clone();
    let factory: TransportFactory = Box::new(move || {
        Box::new(MockTransport {
            outbound: outbound_tx.clone(),
            inbound: inbound_for_factory.clone(),
        })
    });

    (
        factory,
        MockWire {
            outbound: outbound_rx,
            inbound: inbound_tx,
        },
    )
}

struct MockTransport {
    outbound: mpsc::Sender<WireFrame>,
    inbound: broadcast::Sender<WireFrame>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn split(self: Box<Self>) -> Result<(Box<dyn TransportTx>, Box<dyn TransportRx>)> {
        let rx = self.inbound.subscribe();
        Ok((
            Box::new(MockTx {
                outbound: self.outbound,
            }),
            Box::new(MockRx { inbound: rx }),
        ))
    }
}

struct MockTx {
    outbound: mpsc::Sender<WireFrame>,
}

#[async_trait]
impl TransportTx for MockTx {
    async fn send(&mut self, frame: WireFrame) -> Result<()> {
        let _ = self.outbound.send(frame).await;
        Ok(())
    }

    async fn close(&mut self) {}
}

struct MockRx {
    inbound: broadcast::Receiver<WireFrame>,
}

#[async_trait]
impl TransportRx for MockRx {
    async fn recv(&mut self) -> Option<WireFrame> {
        loop {
            match self.inbound.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
