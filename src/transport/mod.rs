//! Transports that deliver gauge readings.
//!
//! Two variants share one contract: [`DirectLink`] talks to the serial port,
//! [`RelayedSocket`] reaches it through the WebSocket relay bridge. Both
//! report everything through a closed set of [`LinkEvent`]s on an unbounded
//! channel and never return transport failures into unrelated call stacks.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{error, info};
use tokio::sync::mpsc;

use crate::codec::{Reading, COMMAND_LEN};
use crate::errors::{DriverError, Result};

mod direct;
mod relay;

pub use direct::{DirectLink, DirectLinkConfig, DEFAULT_GRACE_WINDOW, DEFAULT_RETRY_INTERVAL};
pub use relay::{RelayConfig, RelayedSocket, DEFAULT_RECONNECT_DELAY, DEFAULT_RELAY_URL};

// ============================================================================
// Events
// ============================================================================

/// Notification emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Reading(Reading),
    /// Informational message for display.
    Log(String),
    /// Failure message for display.
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<LinkEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Create the channel a transport (or the manager) publishes on.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Publishing side of the event channel, mirroring log/error events into the
/// `log` facade. A closed receiver is not an error for the transport.
#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    tx: EventSender,
    source: &'static str,
}

impl Emitter {
    pub(crate) fn new(tx: EventSender, kind: TransportKind) -> Self {
        Self::labelled(tx, kind.as_str())
    }

    /// Emitter for a publisher that is not a transport, e.g. the manager.
    pub(crate) fn labelled(tx: EventSender, source: &'static str) -> Self {
        Self { tx, source }
    }

    pub(crate) fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn log(&self, msg: impl Into<String>) {
        let msg = msg.into();
        info!("[{}] {}", self.source, msg);
        self.emit(LinkEvent::Log(msg));
    }

    pub(crate) fn error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        error!("[{}] {}", self.source, msg);
        self.emit(LinkEvent::Error(msg));
    }

    pub(crate) fn readings(&self, readings: Vec<Reading>) {
        for r in readings {
            self.emit(LinkEvent::Reading(r));
        }
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_active(self) -> bool {
        self != ConnectionState::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Connection state shared between a transport handle and its background task.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `from` to `to` only if currently in `from`.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Store `to` and return the previous state.
    pub(crate) fn replace(&self, to: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(to as u8, Ordering::SeqCst))
    }

    /// Set Disconnected; true if this call made the change.
    pub(crate) fn drop_to_disconnected(&self) -> bool {
        self.0.swap(ConnectionState::Disconnected as u8, Ordering::SeqCst)
            != ConnectionState::Disconnected as u8
    }
}

// ============================================================================
// Variants
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    DirectLink,
    RelayedSocket,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::DirectLink => "direct link",
            TransportKind::RelayedSocket => "relayed socket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a command before it goes on the wire: non-empty, exactly 5 bytes.
pub fn validate_command(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(DriverError::InvalidCommand("empty command".into()));
    }
    if bytes.len() != COMMAND_LEN {
        return Err(DriverError::InvalidCommand(format!(
            "expected {COMMAND_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Format command bytes the way they are logged.
pub(crate) fn format_bytes(bytes: &[u8]) -> String {
    let parts: Vec<_> = bytes.iter().map(|b| b.to_string()).collect();
    format!("[{}]", parts.join(", "))
}
