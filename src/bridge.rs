//! WebSocket relay for the gauge's serial port.
//!
//! Raw bytes pass through unchanged in both directions: everything read from
//! the port is broadcast to every connected client as a binary message, and
//! every non-empty binary message from a client is written to the port.
//! [`RelayedSocket`](crate::transport::RelayedSocket) is the matching client.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::errors::{DriverError, Result};
use crate::link::{
    read_chunk, write_command, Chunk, LinkOpener, LinkReader, LinkWriter, SerialOpener,
};
use crate::transport::format_bytes;

/// Address the bridge listens on by default.
pub const DEFAULT_LISTEN_ADDR: &str = "localhost:8765";

/// Serial chunks buffered per client before the slowest one starts lagging.
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen: String,
    pub serial: SerialOpener,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            serial: SerialOpener::default(),
        }
    }
}

type SharedWriter = Arc<Mutex<Box<dyn LinkWriter>>>;

/// A bound relay, ready to [`run`](Bridge::run).
pub struct Bridge {
    listener: TcpListener,
    reader: Box<dyn LinkReader>,
    writer: SharedWriter,
    link_name: String,
}

impl Bridge {
    /// Open the serial port from `config` and bind the listener.
    pub async fn bind(config: BridgeConfig) -> Result<Self> {
        let opener: Arc<dyn LinkOpener> = Arc::new(config.serial);
        Self::bind_with_opener(&config.listen, opener).await
    }

    pub async fn bind_with_opener(listen: &str, opener: Arc<dyn LinkOpener>) -> Result<Self> {
        let link_name = opener.describe();
        let halves = tokio::task::spawn_blocking(move || opener.open())
            .await
            .map_err(|e| DriverError::Io(std::io::Error::other(e.to_string())))??;
        let listener = TcpListener::bind(listen).await?;
        info!("bridge listening on ws://{}", listener.local_addr()?);

        Ok(Self {
            listener,
            reader: halves.reader,
            writer: Arc::new(Mutex::new(halves.writer)),
            link_name,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve clients until `shutdown` fires or the serial link fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let stop = shutdown.child_token();
        let (tx, _) = broadcast::channel::<Vec<u8>>(BROADCAST_CAPACITY);
        let serial_task = tokio::spawn(pump_serial(self.reader, tx.clone(), stop.clone()));
        tokio::pin!(serial_task);

        let result = loop {
            tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                res = &mut serial_task => {
                    break match res {
                        Ok(r) => r,
                        Err(e) => Err(DriverError::Io(std::io::Error::other(e.to_string()))),
                    };
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(serve_client(
                                stream,
                                peer,
                                tx.subscribe(),
                                Arc::clone(&self.writer),
                                stop.clone(),
                            ));
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
            }
        };

        stop.cancel();
        info!("bridge for {} stopped", self.link_name);
        result
    }
}

async fn pump_serial(
    mut reader: Box<dyn LinkReader>,
    tx: broadcast::Sender<Vec<u8>>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (r, chunk) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            res = read_chunk(reader) => res,
        };
        reader = r;
        match chunk {
            Chunk::Data(bytes) => {
                // no subscribers is fine, bytes are simply dropped
                let _ = tx.send(bytes);
            }
            Chunk::Idle => {}
            Chunk::Eof => {
                error!("serial link closed");
                return Err(DriverError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            Chunk::Failed(e) => {
                error!("serial read failed: {}", e);
                return Err(e.into());
            }
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    mut serial_rx: broadcast::Receiver<Vec<u8>>,
    writer: SharedWriter,
    shutdown: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    info!("client connected: {}", peer);
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.close().await;
                break;
            }
            chunk = serial_rx.recv() => match chunk {
                Ok(bytes) => {
                    if sink.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("client {} lagging, skipped {} chunks", peer, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = source.next() => match msg {
                Some(Ok(Message::Binary(bytes))) if !bytes.is_empty() => {
                    write_to_link(&writer, bytes).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(other)) => debug!("ignoring message from {}: {:?}", peer, other),
                Some(Err(e)) => {
                    debug!("client {} read failed: {}", peer, e);
                    break;
                }
            },
        }
    }

    info!("client disconnected: {}", peer);
}

async fn write_to_link(writer: &SharedWriter, bytes: Vec<u8>) {
    let writer = Arc::clone(writer);
    let written = tokio::task::spawn_blocking(move || {
        let mut guard = writer.lock().unwrap_or_else(|p| p.into_inner());
        write_command(guard.as_mut(), &bytes).map(|()| bytes)
    })
    .await;
    match written {
        Ok(Ok(bytes)) => info!("sent to gauge: {}", format_bytes(&bytes)),
        Ok(Err(e)) => warn!("serial write failed: {}", e),
        Err(e) => warn!("serial write task failed: {}", e),
    }
}
