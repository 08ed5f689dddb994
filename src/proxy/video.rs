//! Proxy video plane: one upstream MJPEG connection fanned out to any number
//! of downstream HTTP clients.
//!
//! The upstream pump runs only while at least one downstream is attached and
//! is closed five seconds after the last one leaves, so the printer's scarce
//! video slots are never held idle. The multipart boundary is parsed from
//! whatever the upstream actually sends and re-emitted verbatim; firmware
//! versions disagree on the string.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::Result;

/// Ring of JPEG parts per downstream; laggards skip frames instead of
/// building a backlog.
const FRAME_RING: usize = 2;
/// Upstream linger after the last downstream disconnects.
const LINGER: Duration = Duration::from_secs(5);

enum HubCtl {
    Subscribe {
        reply: oneshot::Sender<(watch::Receiver<Option<String>>, broadcast::Receiver<Bytes>)>,
    },
}

struct SharedState {
    ctl_tx: mpsc::Sender<HubCtl>,
}

/// Start the video plane. Returns the task handles and the bound port.
pub async fn start(upstream_url: String, port: u16) -> Result<(Vec<JoinHandle<()>>, u16)> {
    let (ctl_tx, ctl_rx) = mpsc::channel(16);
    let hub = tokio::spawn(hub_task(upstream_url, ctl_rx));

    let state = Arc::new(SharedState { ctl_tx });
    let app = Router::new()
        .route("/", get(stream_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let bound = listener.local_addr()?.port();
    tracing::info!("proxy video endpoint on :{bound}/?action=stream");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("proxy video server stopped: {e}");
        }
    });

    Ok((vec![hub, server], bound))
}

async fn stream_handler(State(state): State<Arc<SharedState>>) -> Response {
    let (reply, reply_rx) = oneshot::channel();
    if state
        .ctl_tx
        .send(HubCtl::Subscribe { reply })
        .await
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let Ok((mut content_type_rx, frames)) = reply_rx.await else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    // The content type is known once the pump has connected upstream.
    let content_type = match tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ct) = content_type_rx.borrow().clone() {
                return ct;
            }
            if content_type_rx.changed().await.is_err() {
                return String::new();
            }
        }
    })
    .await
    {
        Ok(ct) if !ct.is_empty() => ct,
        _ => return StatusCode::BAD_GATEWAY.into_response(),
    };

    let mut frames = frames;
    let body = async_stream::stream! {
        loop {
            match frames.recv().await {
                Ok(part) => yield Ok::<Bytes, std::io::Error>(part),
                // Lagging just skips frames; the ring holds the newest two.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn hub_task(upstream_url: String, mut ctl_rx: mpsc::Receiver<HubCtl>) {
    let (frames_tx, _) = broadcast::channel::<Bytes>(FRAME_RING);
    let (content_type_tx, content_type_rx) = watch::channel::<Option<String>>(None);
    let mut pump: Option<JoinHandle<()>> = None;
    let mut idle_since: Option<tokio::time::Instant> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            ctl = ctl_rx.recv() => match ctl {
                None => break,
                Some(HubCtl::Subscribe { reply }) => {
                    if pump.as_ref().map(|p| p.is_finished()).unwrap_or(true) {
                        pump = Some(tokio::spawn(pump_task(
                            upstream_url.clone(),
                            frames_tx.clone(),
                            content_type_tx.clone(),
                        )));
                    }
                    idle_since = None;
                    let _ = reply.send((content_type_rx.clone(), frames_tx.subscribe()));
                }
            },
            _ = tick.tick() => {
                // receiver_count counts attached downstream bodies. The
                // upstream is torn down only after the linger window, and
                // there is never more than one pump.
                if frames_tx.receiver_count() == 0 {
                    let since = *idle_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() >= LINGER {
                        if let Some(pump) = pump.take() {
                            tracing::debug!("no video downstreams, closing upstream stream");
                            pump.abort();
                            let _ = content_type_tx.send(None);
                        }
                    }
                } else {
                    idle_since = None;
                }
            }
        }
    }
    if let Some(pump) = pump.take() {
        pump.abort();
    }
    tracing::debug!("video hub stopped");
}

/// Pull the upstream MJPEG stream, split it into parts and publish them.
/// Reconnects while downstreams remain attached.
async fn pump_task(
    url: String,
    frames_tx: broadcast::Sender<Bytes>,
    content_type_tx: watch::Sender<Option<String>>,
) {
    let client = reqwest::Client::new();
    loop {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let content_type = resp
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("multipart/x-mixed-replace")
                    .to_string();
                let boundary = parse_boundary(&content_type);
                let _ = content_type_tx.send(Some(content_type));
                tracing::debug!("upstream video connected, boundary {boundary:?}");

                let mut splitter = MultipartSplitter::new(boundary);
                let mut stream = resp.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => {
                            for part in splitter.feed(&chunk) {
                                // No receivers is fine; the hub handles
                                // teardown on its own clock.
                                let _ = frames_tx.send(part);
                            }
                        }
                        Err(e) => {
                            tracing::debug!("upstream video read error: {e}");
                            break;
                        }
                    }
                }
            }
            Ok(resp) => {
                tracing::debug!("upstream video refused: {}", resp.status());
            }
            Err(e) => {
                tracing::debug!("upstream video connect failed: {e}");
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Extract the boundary parameter from a multipart content type.
pub fn parse_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_lowercase();
    let idx = lower.find("boundary=")?;
    let raw = &content_type[idx + "boundary=".len()..];
    let raw = raw.split(';').next().unwrap_or(raw).trim();
    let raw = raw.trim_matches('"');
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

/// Splits an MJPEG byte stream into delimiter-aligned parts.
///
/// Each emitted part starts at a `--boundary` marker and runs to the next
/// one, headers included, so concatenating parts reproduces the upstream
/// stream byte for byte and late joiners always start on a frame edge. When
/// the content type named no boundary, the first `--`-prefixed line observed
/// is adopted.
pub struct MultipartSplitter {
    delimiter: Option<Vec<u8>>,
    buf: Vec<u8>,
}

impl MultipartSplitter {
    pub fn new(boundary: Option<String>) -> Self {
        Self {
            delimiter: boundary.map(|b| format!("--{b}").into_bytes()),
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);

        if self.delimiter.is_none() {
            let _ = self.adopt_observed_delimiter();
        }
        let Some(delimiter) = self.delimiter.clone() else {
            return Vec::new();
        };

        let mut parts = Vec::new();
        loop {
            let Some(first) = find(&self.buf, &delimiter) else {
                break;
            };
            // Bytes before the first marker are a partial part from before we
            // attached; drop them.
            if first > 0 {
                self.buf.drain(..first);
                continue;
            }
            let Some(next) = find(&self.buf[delimiter.len()..], &delimiter) else {
                break;
            };
            let end = delimiter.len() + next;
            let part: Vec<u8> = self.buf.drain(..end).collect();
            parts.push(Bytes::from(part));
        }
        parts
    }

    fn adopt_observed_delimiter(&mut self) -> Option<()> {
        let start = find(&self.buf, b"--")?;
        let rest = &self.buf[start..];
        let line_end = find(rest, b"\r\n")?;
        if line_end > 2 {
            self.delimiter = Some(rest[..line_end].to_vec());
        }
        Some(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_parsing() {
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace; boundary=frame"),
            Some("frame".to_string())
        );
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace; boundary=\"mjpg-boundary\""),
            Some("mjpg-boundary".to_string())
        );
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace;boundary=b; charset=x"),
            Some("b".to_string())
        );
        assert_eq!(parse_boundary("image/jpeg"), None);
    }

    #[test]
    fn splitter_emits_complete_parts() {
        let mut splitter = MultipartSplitter::new(Some("frame".into()));
        let stream = b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG1\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG2\r\n--frame\r\n";
        let parts = splitter.feed(stream);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with(b"--frame"));
        assert!(parts[0].ends_with(b"JPEG1\r\n"));
        assert!(parts[1].ends_with(b"JPEG2\r\n"));
    }

    #[test]
    fn splitter_handles_chunk_fragmentation() {
        let mut splitter = MultipartSplitter::new(Some("b".into()));
        let mut parts = Vec::new();
        let stream = b"--b\r\n\r\nAAAA\r\n--b\r\n\r\nBBBB\r\n--b\r\n";
        for chunk in stream.chunks(3) {
            parts.extend(splitter.feed(chunk));
        }
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with(b"AAAA\r\n"));
        assert!(parts[1].ends_with(b"BBBB\r\n"));
    }

    #[test]
    fn splitter_drops_partial_head() {
        // Joined mid-stream: leading bytes before the first marker go away.
        let mut splitter = MultipartSplitter::new(Some("frame".into()));
        let parts = splitter.feed(b"EG_TAIL\r\n--frame\r\n\r\nFULL\r\n--frame\r\n");
        assert_eq!(parts.len(), 1);
        assert!(parts[0].ends_with(b"FULL\r\n"));
    }

    #[test]
    fn splitter_adopts_observed_boundary() {
        let mut splitter = MultipartSplitter::new(None);
        let parts =
            splitter.feed(b"--mystery\r\n\r\nONE\r\n--mystery\r\n\r\nTWO\r\n--mystery\r\n");
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with(b"--mystery"));
    }
}
