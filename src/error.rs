//! Error types for the printer connectivity core.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Errors from printer discovery, sessions and the proxy.
#[derive(Error, Debug)]
pub enum ElegooError {
    /// No printers answered a discovery probe.
    #[error("no printers answered discovery")]
    DiscoveryEmpty,

    /// The printer is in a mode we refuse to talk to (e.g. CC2 cloud mode).
    #[error("unsupported mode: {0}")]
    UnsupportedMode(String),

    /// The transport socket closed or timed out.
    #[error("transport reset: {0}")]
    TransportReset(String),

    /// Registration with the printer failed.
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    /// The printer reported "too many clients" during registration.
    #[error("printer connection slots exhausted")]
    SlotExhausted,

    /// No response arrived within the request deadline.
    #[error("request timed out (method {method})")]
    RequestTimeout { method: u32 },

    /// Malformed frame or unknown envelope.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Printer transient-busy (error 1009).
    #[error("printer busy")]
    PrinterBusy,

    /// Missing target file (errors 1021, 9007).
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Bad access token (error 1000).
    #[error("unauthorized: access code rejected")]
    UnauthorizedAccess,

    /// MD5 mismatch on upload (error 9004).
    #[error("upload checksum mismatch")]
    ChecksumMismatch,

    /// A proxy downstream stopped draining its queue.
    #[error("slow consumer disconnected")]
    SlowConsumer,

    /// The session was closed while the operation was outstanding.
    #[error("session closed")]
    SessionClosed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Auxiliary HTTP error.
    #[error("http error: {0}")]
    Http(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for printer operations.
pub type Result<T> = std::result::Result<T, ElegooError>;

impl ElegooError {
    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ElegooError::TransportReset(_)
                | ElegooError::RequestTimeout { .. }
                | ElegooError::PrinterBusy
                | ElegooError::SlotExhausted
                | ElegooError::ChecksumMismatch
        )
    }

    /// Suggested delay before a retry, where one applies.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ElegooError::SlotExhausted => Some(Duration::from_secs(65)),
            ElegooError::PrinterBusy => Some(Duration::from_secs(5)),
            _ => None,
        }
    }

    /// Map a nonzero printer application error code to a typed error.
    pub fn from_printer_code(code: i64, context: &str) -> ElegooError {
        match code {
            1000 => ElegooError::UnauthorizedAccess,
            1009 => ElegooError::PrinterBusy,
            1021 | 9007 => ElegooError::FileNotFound(context.to_string()),
            9004 => ElegooError::ChecksumMismatch,
            other => ElegooError::ProtocolError(format!("printer error {other}: {context}")),
        }
    }

    /// Stable label used for rate-limited logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ElegooError::DiscoveryEmpty => "discovery-empty",
            ElegooError::UnsupportedMode(_) => "unsupported-mode",
            ElegooError::TransportReset(_) => "transport-reset",
            ElegooError::RegistrationFailed(_) => "registration-failed",
            ElegooError::SlotExhausted => "slot-exhausted",
            ElegooError::RequestTimeout { .. } => "request-timeout",
            ElegooError::ProtocolError(_) => "protocol-error",
            ElegooError::PrinterBusy => "printer-busy",
            ElegooError::FileNotFound(_) => "file-not-found",
            ElegooError::UnauthorizedAccess => "unauthorized",
            ElegooError::ChecksumMismatch => "checksum-mismatch",
            ElegooError::SlowConsumer => "slow-consumer",
            ElegooError::SessionClosed => "session-closed",
            ElegooError::Config(_) => "config",
            ElegooError::Http(_) => "http",
            ElegooError::Io(_) => "io",
            ElegooError::Json(_) => "json",
        }
    }
}

/// Emits at most one WARN per error kind per window (60 s by default).
///
/// Repeated identical failures during an outage would otherwise flood the log
/// at the poll rate.
pub struct WarnLimiter {
    window: Duration,
    last: Mutex<HashMap<&'static str, Instant>>,
}

impl WarnLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Log `err` at WARN if its kind has not been logged within the window.
    /// Returns true when the message was actually emitted.
    pub fn warn(&self, err: &ElegooError, context: &str) -> bool {
        let kind = err.kind();
        let mut last = self.last.lock().expect("warn limiter poisoned");
        let now = Instant::now();
        match last.get(kind) {
            Some(prev) if now.duration_since(*prev) < self.window => false,
            _ => {
                last.insert(kind, now);
                tracing::warn!("{context}: {err}");
                true
            }
        }
    }
}

impl Default for WarnLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
