use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{
    format_bytes, validate_command, ConnectionState, Emitter, EventSender, LinkEvent, StateCell,
    TransportKind,
};
use crate::errors::{DriverError, Result};
use crate::sync::FrameSynchronizer;

/// Address the relay bridge listens on by default.
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8765";

/// Wait between losing the relay and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    /// Upper bound for a single connection attempt.
    pub connect_timeout: Duration,
    /// Reconnect after the relay drops a working connection.
    pub auto_reconnect: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_reconnect: true,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type SharedSink = Arc<Mutex<Option<WsSink>>>;

async fn open_socket(config: &RelayConfig) -> Result<WsStream> {
    let attempt = connect_async(config.url.as_str());
    let (ws, _response) = tokio::time::timeout(config.connect_timeout, attempt)
        .await
        .map_err(|_| DriverError::Timeout(format!("connecting to {}", config.url)))??;
    Ok(ws)
}

/// WebSocket client to the relay bridge.
///
/// Binary messages carry raw gauge bytes and go through this socket's own
/// [`FrameSynchronizer`]. A connection that was up and then drops is retried
/// every `reconnect_delay` until [`disconnect`](Self::disconnect) is called;
/// a first connection that never comes up is reported once and not retried.
pub struct RelayedSocket {
    config: RelayConfig,
    emitter: Emitter,
    state: StateCell,
    sink: SharedSink,
    auto_reconnect: Arc<AtomicBool>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl RelayedSocket {
    pub fn new(config: RelayConfig, events: EventSender) -> Self {
        let auto_reconnect = Arc::new(AtomicBool::new(config.auto_reconnect));
        Self {
            config,
            emitter: Emitter::new(events, TransportKind::RelayedSocket),
            state: StateCell::new(),
            sink: Arc::new(Mutex::new(None)),
            auto_reconnect,
            cancel: None,
            task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Enable or disable reconnection for the current session.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    pub async fn connect(&mut self) -> Result<()> {
        if !self
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(DriverError::AlreadyActive(TransportKind::RelayedSocket));
        }
        if let Some(previous) = self.task.take() {
            let _ = previous.await;
        }
        self.auto_reconnect
            .store(self.config.auto_reconnect, Ordering::SeqCst);

        self.emitter
            .log(format!("connecting to relay {}", self.config.url));
        let ws = match open_socket(&self.config).await {
            Ok(ws) => ws,
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                self.emitter
                    .error(format!("could not connect to relay {}: {e}", self.config.url));
                return Err(e);
            }
        };

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);

        let cancel = CancellationToken::new();
        let session = Session {
            config: self.config.clone(),
            sync: FrameSynchronizer::new(),
            emitter: self.emitter.clone(),
            state: self.state.clone(),
            sink: Arc::clone(&self.sink),
            auto_reconnect: Arc::clone(&self.auto_reconnect),
            cancel: cancel.clone(),
        };

        self.state.set(ConnectionState::Connected);
        self.emitter.emit(LinkEvent::Connected);
        self.emitter.log(format!("connected to relay {}", self.config.url));

        self.task = Some(tokio::spawn(session.run(stream)));
        self.cancel = Some(cancel);
        Ok(())
    }

    /// Close the socket and cancel any pending reconnection. Safe to call in
    /// any state and more than once.
    pub async fn disconnect(&mut self) {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        }

        match self.state.replace(ConnectionState::Disconnected) {
            ConnectionState::Connected => {
                self.emitter.emit(LinkEvent::Disconnected);
                self.emitter.log("disconnected");
            }
            ConnectionState::Connecting => self.emitter.log("reconnection cancelled"),
            ConnectionState::Disconnected => {}
        }
    }

    /// Send a 5-byte command through the relay.
    pub async fn send(&self, command: &[u8]) -> Result<()> {
        if self.state.get() != ConnectionState::Connected {
            self.emitter.error("cannot send command: not connected");
            return Err(DriverError::NotConnected);
        }
        if let Err(e) = validate_command(command) {
            self.emitter.error(format!("cannot send command: {e}"));
            return Err(e);
        }

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            self.emitter.error("cannot send command: socket unavailable");
            return Err(DriverError::NotConnected);
        };
        match sink.send(Message::Binary(command.to_vec())).await {
            Ok(()) => {
                self.emitter.log(format!("sent {}", format_bytes(command)));
                Ok(())
            }
            Err(e) => {
                self.emitter.error(format!("command send failed: {e}"));
                Err(e.into())
            }
        }
    }
}

impl Drop for RelayedSocket {
    fn drop(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

// ============================================================================
// Session
// ============================================================================

struct Session {
    config: RelayConfig,
    sync: FrameSynchronizer,
    emitter: Emitter,
    state: StateCell,
    sink: SharedSink,
    auto_reconnect: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Session {
    async fn run(mut self, mut stream: SplitStream<WsStream>) {
        loop {
            self.pump(&mut stream).await;
            // disconnect() closes the sink itself
            if self.cancel.is_cancelled() {
                return;
            }
            self.sink.lock().await.take();

            if !self.auto_reconnect.load(Ordering::SeqCst) {
                if self.state.drop_to_disconnected() {
                    self.emitter.emit(LinkEvent::Disconnected);
                }
                self.emitter.log("relay closed");
                return;
            }

            self.state.set(ConnectionState::Connecting);
            self.emitter.emit(LinkEvent::Disconnected);
            self.emitter.log(format!(
                "relay closed, reconnecting in {:?}",
                self.config.reconnect_delay
            ));

            match self.reconnect().await {
                Some(next) => stream = next,
                None => return,
            }
        }
    }

    /// Forward binary messages to the synchronizer until the socket closes.
    async fn pump(&mut self, stream: &mut SplitStream<WsStream>) {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => return,
                msg = stream.next() => msg,
            };
            match msg {
                Some(Ok(Message::Binary(data))) => {
                    let readings = self.sync.feed(&data);
                    debug!(
                        "relay message {} bytes, {} readings",
                        data.len(),
                        readings.len()
                    );
                    self.emitter.readings(readings);
                }
                Some(Ok(Message::Text(_))) => debug!("ignoring text message from relay"),
                Some(Ok(Message::Close(frame))) => {
                    info!("relay sent close: {:?}", frame);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("relay read failed: {}", e);
                    return;
                }
                None => return,
            }
        }
    }

    /// Retry every `reconnect_delay` until connected or cancelled.
    async fn reconnect(&mut self) -> Option<SplitStream<WsStream>> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
            if !self.auto_reconnect.load(Ordering::SeqCst) {
                self.state.set(ConnectionState::Disconnected);
                self.emitter.log("reconnection disabled");
                return None;
            }

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                res = open_socket(&self.config) => res,
            };
            match opened {
                Ok(ws) => {
                    let (sink, stream) = ws.split();
                    *self.sink.lock().await = Some(sink);
                    self.sync.reset();
                    self.state.set(ConnectionState::Connected);
                    self.emitter.emit(LinkEvent::Connected);
                    self.emitter
                        .log(format!("reconnected to relay {}", self.config.url));
                    return Some(stream);
                }
                Err(e) => {
                    self.emitter.log(format!(
                        "reconnect failed ({e}), retrying in {:?}",
                        self.config.reconnect_delay
                    ));
                }
            }
        }
    }
}
