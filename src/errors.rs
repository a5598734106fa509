use std::io;
use thiserror::Error;

use crate::transport::TransportKind;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("port discovery failed: {0}")]
    Discovery(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("not connected")]
    NotConnected,
    #[error("{0} is already active, disconnect first")]
    AlreadyActive(TransportKind),
    #[error("{0} is not available in this environment")]
    Unavailable(TransportKind),
    #[error("timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
