use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    format_bytes, validate_command, ConnectionState, Emitter, EventSender, LinkEvent, StateCell,
    TransportKind,
};
use crate::errors::{DriverError, Result};
use crate::link::{
    read_chunk, write_command, Chunk, LinkHalves, LinkOpener, LinkReader, LinkWriter,
    SerialOpener,
};
use crate::sync::FrameSynchronizer;

/// How long read failures are retried before the link is declared lost.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(5);

/// Delay between reacquisition attempts inside the grace window.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DirectLinkConfig {
    pub serial: SerialOpener,
    pub grace_window: Duration,
    pub retry_interval: Duration,
}

impl Default for DirectLinkConfig {
    fn default() -> Self {
        Self {
            serial: SerialOpener::default(),
            grace_window: DEFAULT_GRACE_WINDOW,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

type SharedWriter = Arc<Mutex<Option<Box<dyn LinkWriter>>>>;

fn lock(writer: &SharedWriter) -> MutexGuard<'_, Option<Box<dyn LinkWriter>>> {
    writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn open_link(opener: &Arc<dyn LinkOpener>) -> Result<LinkHalves> {
    let opener = Arc::clone(opener);
    tokio::task::spawn_blocking(move || opener.open())
        .await
        .map_err(|e| DriverError::Io(std::io::Error::other(e.to_string())))?
}

/// Point-to-point serial transport.
///
/// A background task reads chunks, feeds them to this link's own
/// [`FrameSynchronizer`] and publishes one [`LinkEvent::Reading`] per decoded
/// frame. Read failures are retried silently inside the grace window; when
/// the window runs out a single [`LinkEvent::Error`] is published and the link
/// stays [`ConnectionState::Disconnected`] until `connect()` is called again.
pub struct DirectLink {
    grace_window: Duration,
    retry_interval: Duration,
    opener: Arc<dyn LinkOpener>,
    emitter: Emitter,
    state: StateCell,
    writer: SharedWriter,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl DirectLink {
    pub fn new(config: DirectLinkConfig, events: EventSender) -> Self {
        let opener: Arc<dyn LinkOpener> = Arc::new(config.serial.clone());
        Self::with_opener(config, opener, events)
    }

    /// Use a custom opener instead of the serial port from `config`.
    pub fn with_opener(
        config: DirectLinkConfig,
        opener: Arc<dyn LinkOpener>,
        events: EventSender,
    ) -> Self {
        Self {
            grace_window: config.grace_window,
            retry_interval: config.retry_interval,
            opener,
            emitter: Emitter::new(events, TransportKind::DirectLink),
            state: StateCell::new(),
            writer: Arc::new(Mutex::new(None)),
            cancel: None,
            task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Open the link and start the read loop.
    ///
    /// A failed open is reported as an error event as well as returned.
    pub async fn connect(&mut self) -> Result<()> {
        if !self
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(DriverError::AlreadyActive(TransportKind::DirectLink));
        }
        if let Some(previous) = self.task.take() {
            let _ = previous.await;
        }

        let target = self.opener.describe();
        let halves = match open_link(&self.opener).await {
            Ok(h) => h,
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                self.emitter.error(format!("failed to open {target}: {e}"));
                return Err(e);
            }
        };

        *lock(&self.writer) = Some(halves.writer);
        let cancel = CancellationToken::new();
        let read_loop = ReadLoop {
            reader: Some(halves.reader),
            sync: FrameSynchronizer::new(),
            opener: Arc::clone(&self.opener),
            writer: Arc::clone(&self.writer),
            emitter: self.emitter.clone(),
            state: self.state.clone(),
            cancel: cancel.clone(),
            grace_window: self.grace_window,
            retry_interval: self.retry_interval,
        };

        self.state.set(ConnectionState::Connected);
        self.emitter.emit(LinkEvent::Connected);
        self.emitter.log(format!("connected to {target}"));

        self.task = Some(tokio::spawn(read_loop.run()));
        self.cancel = Some(cancel);
        Ok(())
    }

    /// Stop the read loop and release the port. Safe to call in any state,
    /// including mid-retry, and more than once.
    pub async fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        // a reacquire racing the cancel may have stored a fresh writer
        lock(&self.writer).take();
        if self.state.drop_to_disconnected() {
            self.emitter.emit(LinkEvent::Disconnected);
            self.emitter.log("disconnected");
        }
    }

    /// Write a 5-byte command. Only valid while connected; failures are
    /// reported as error events and nothing is written.
    pub async fn send(&self, command: &[u8]) -> Result<()> {
        if self.state.get() != ConnectionState::Connected {
            self.emitter.error("cannot send command: not connected");
            return Err(DriverError::NotConnected);
        }
        if let Err(e) = validate_command(command) {
            self.emitter.error(format!("cannot send command: {e}"));
            return Err(e);
        }

        let writer = Arc::clone(&self.writer);
        let bytes = command.to_vec();
        let written = tokio::task::spawn_blocking(move || match lock(&writer).as_mut() {
            Some(w) => write_command(w.as_mut(), &bytes).map(|()| true),
            None => Ok(false),
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
        .and_then(|res| res);

        match written {
            Ok(true) => {
                self.emitter.log(format!("sent {}", format_bytes(command)));
                Ok(())
            }
            Ok(false) => {
                self.emitter.error("cannot send command: link unavailable");
                Err(DriverError::NotConnected)
            }
            Err(e) => {
                self.emitter.error(format!("command write failed: {e}"));
                Err(e.into())
            }
        }
    }
}

impl Drop for DirectLink {
    fn drop(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

// ============================================================================
// Read loop
// ============================================================================

struct ReadLoop {
    /// `None` while the link is being reacquired.
    reader: Option<Box<dyn LinkReader>>,
    sync: FrameSynchronizer,
    opener: Arc<dyn LinkOpener>,
    writer: SharedWriter,
    emitter: Emitter,
    state: StateCell,
    cancel: CancellationToken,
    grace_window: Duration,
    retry_interval: Duration,
}

impl ReadLoop {
    async fn run(mut self) {
        loop {
            let reader = match self.reader.take() {
                Some(r) => r,
                None => match self.reacquire().await {
                    Some(r) => r,
                    None => return,
                },
            };

            let (reader, chunk) = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = read_chunk(reader) => res,
            };

            match chunk {
                Chunk::Data(bytes) => {
                    self.reader = Some(reader);
                    let readings = self.sync.feed(&bytes);
                    debug!(
                        "read {} bytes, {} readings, {} buffered",
                        bytes.len(),
                        readings.len(),
                        self.sync.buffered_len()
                    );
                    self.emitter.readings(readings);
                }
                Chunk::Idle => self.reader = Some(reader),
                Chunk::Eof => {
                    info!("serial link reached end of stream");
                    self.finish();
                    return;
                }
                Chunk::Failed(e) => {
                    warn!("serial read failed: {}", e);
                    drop(reader);
                    self.emitter.log(format!(
                        "read error ({e}), retrying for up to {:?}",
                        self.grace_window
                    ));
                }
            }
        }
    }

    /// Reopen the link every `retry_interval` until it works or the grace
    /// window elapses. Returns `None` when the loop must stop.
    async fn reacquire(&mut self) -> Option<Box<dyn LinkReader>> {
        self.state
            .transition(ConnectionState::Connected, ConnectionState::Connecting);
        lock(&self.writer).take();

        let deadline = Instant::now() + self.grace_window;
        let mut attempt = 0u32;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
            attempt += 1;

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                res = open_link(&self.opener) => res,
            };
            match opened {
                Ok(halves) => {
                    *lock(&self.writer) = Some(halves.writer);
                    self.sync.reset();
                    self.state
                        .transition(ConnectionState::Connecting, ConnectionState::Connected);
                    self.emitter
                        .log(format!("link reacquired after {attempt} attempt(s)"));
                    return Some(halves.reader);
                }
                Err(e) => {
                    debug!("reacquire attempt {} failed: {}", attempt, e);
                    if Instant::now() >= deadline {
                        self.emitter.error(format!(
                            "link lost: not recovered within {:?} ({e})",
                            self.grace_window
                        ));
                        self.finish();
                        return None;
                    }
                }
            }
        }
    }

    fn finish(&mut self) {
        lock(&self.writer).take();
        if self.state.drop_to_disconnected() {
            self.emitter.emit(LinkEvent::Disconnected);
        }
    }
}
