//! Periodic refresh loop around a session.
//!
//! Drives a status request every tick (2 s default). At most one request is
//! in flight: the loop awaits each poll, and the interval's Skip behavior
//! drops ticks that elapsed meanwhile instead of queueing them. Repeated
//! timeouts force a reconnect; the session's own backoff bounds it.

use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::error::ElegooError;
use crate::model::ProtocolKind;
use crate::protocol::{cc2_methods, legacy_methods};
use crate::session::{SessionHandle, SessionState};

/// Consecutive poll timeouts tolerated before forcing a reconnect.
const TIMEOUT_STREAK_LIMIT: u32 = 3;

pub fn spawn(
    session: SessionHandle,
    protocol: ProtocolKind,
    interval: Duration,
) -> JoinHandle<()> {
    let status_method = match protocol {
        ProtocolKind::MqttCc2 => cc2_methods::GET_STATUS,
        _ => legacy_methods::GET_STATUS,
    };

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut state_rx = session.watch_state();
        let mut timeout_streak: u32 = 0;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match session.state() {
                        SessionState::Closed => break,
                        SessionState::Ready | SessionState::Degraded => {}
                        // Connecting/registering/reconnecting: let the
                        // session finish before polling again.
                        _ => continue,
                    }
                    match session.invoke(status_method, json!({}), None).await {
                        Ok(_) => {
                            timeout_streak = 0;
                        }
                        Err(ElegooError::RequestTimeout { .. }) => {
                            timeout_streak += 1;
                            if timeout_streak >= TIMEOUT_STREAK_LIMIT {
                                tracing::warn!(
                                    "{timeout_streak} status polls timed out, forcing reconnect"
                                );
                                timeout_streak = 0;
                                session.force_reconnect().await;
                            }
                        }
                        Err(ElegooError::SessionClosed) => break,
                        Err(e) => {
                            // Transport errors are already being handled by
                            // the session's reconnect loop.
                            tracing::debug!("status poll failed: {e}");
                            timeout_streak = 0;
                        }
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() == SessionState::Closed {
                        break;
                    }
                }
            }
        }
        tracing::debug!("coordinator stopped");
    })
}
