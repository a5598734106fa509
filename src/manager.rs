//! Uniform front for whichever transport is in use.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::errors::{DriverError, Result};
use crate::link::{self, LinkOpener};
use crate::transport::{
    event_channel, ConnectionState, DirectLink, DirectLinkConfig, Emitter, EventReceiver,
    RelayConfig, RelayedSocket, TransportKind,
};

/// Which transports can be used on this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub direct_link: bool,
    pub relayed_socket: bool,
}

impl Capabilities {
    /// Probe the environment without opening anything.
    ///
    /// The direct link is usable when serial ports can be enumerated and at
    /// least one exists, or when `configured_port` names an existing path.
    pub fn detect(configured_port: Option<&str>) -> Self {
        let configured = configured_port.is_some_and(|p| Path::new(p).exists());
        let enumerated = match link::discover_ports() {
            Ok(ports) => !ports.is_empty(),
            Err(e) => {
                debug!("serial port enumeration unavailable: {}", e);
                false
            }
        };
        Self {
            direct_link: configured || enumerated,
            relayed_socket: true,
        }
    }

    pub fn supports(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::DirectLink => self.direct_link,
            TransportKind::RelayedSocket => self.relayed_socket,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub direct: DirectLinkConfig,
    pub relay: RelayConfig,
}

/// The transport currently owned by the manager.
pub enum ActiveTransport {
    Direct(DirectLink),
    Relayed(RelayedSocket),
}

impl ActiveTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            ActiveTransport::Direct(_) => TransportKind::DirectLink,
            ActiveTransport::Relayed(_) => TransportKind::RelayedSocket,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            ActiveTransport::Direct(t) => t.state(),
            ActiveTransport::Relayed(t) => t.state(),
        }
    }

    async fn connect(&mut self) -> Result<()> {
        match self {
            ActiveTransport::Direct(t) => t.connect().await,
            ActiveTransport::Relayed(t) => t.connect().await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            ActiveTransport::Direct(t) => t.disconnect().await,
            ActiveTransport::Relayed(t) => t.disconnect().await,
        }
    }

    async fn send(&self, command: &[u8]) -> Result<()> {
        match self {
            ActiveTransport::Direct(t) => t.send(command).await,
            ActiveTransport::Relayed(t) => t.send(command).await,
        }
    }
}

/// Owns at most one transport and republishes its events.
///
/// Transports publish straight onto the manager's channel, so listeners see
/// every event exactly as the transport produced it.
pub struct ConnectionManager {
    config: ManagerConfig,
    capabilities: Capabilities,
    emitter: Emitter,
    opener: Option<Arc<dyn LinkOpener>>,
    active: Option<ActiveTransport>,
}

impl ConnectionManager {
    /// Create a manager, probing the environment for usable transports.
    pub fn new(config: ManagerConfig) -> (Self, EventReceiver) {
        let capabilities = Capabilities::detect(config.direct.serial.port.as_deref());
        Self::with_capabilities(config, capabilities)
    }

    pub fn with_capabilities(
        config: ManagerConfig,
        capabilities: Capabilities,
    ) -> (Self, EventReceiver) {
        info!(
            "transports available: direct_link={}, relayed_socket={}",
            capabilities.direct_link, capabilities.relayed_socket
        );
        let (tx, rx) = event_channel();
        let manager = Self {
            config,
            capabilities,
            emitter: Emitter::labelled(tx, "manager"),
            opener: None,
            active: None,
        };
        (manager, rx)
    }

    /// Open direct links through `opener` instead of the configured serial port.
    pub fn with_link_opener(mut self, opener: Arc<dyn LinkOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Kind of the transport in use, if any.
    pub fn active_kind(&self) -> Option<TransportKind> {
        self.active.as_ref().map(ActiveTransport::kind)
    }

    pub fn state(&self) -> ConnectionState {
        self.active
            .as_ref()
            .map_or(ConnectionState::Disconnected, ActiveTransport::state)
    }

    /// Create and connect a transport of `kind`.
    ///
    /// Refused while another transport is connected or connecting. A
    /// transport that has dropped to Disconnected on its own is replaced.
    pub async fn connect(&mut self, kind: TransportKind) -> Result<()> {
        if let Some(active) = &self.active {
            if active.state().is_active() {
                return Err(DriverError::AlreadyActive(active.kind()));
            }
        }
        if !self.capabilities.supports(kind) {
            return Err(DriverError::Unavailable(kind));
        }
        if let Some(mut stale) = self.active.take() {
            stale.disconnect().await;
        }

        let mut transport = self.build(kind);
        let result = transport.connect().await;
        self.active = Some(transport);
        result
    }

    /// Disconnect the active transport. No-op when nothing is connected.
    pub async fn disconnect(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.disconnect().await;
        }
    }

    /// Send a command through the active transport.
    pub async fn send(&self, command: &[u8]) -> Result<()> {
        match &self.active {
            Some(active) => active.send(command).await,
            None => {
                self.emitter.error("cannot send command: not connected");
                Err(DriverError::NotConnected)
            }
        }
    }

    fn build(&self, kind: TransportKind) -> ActiveTransport {
        let events = self.emitter.sender();
        match kind {
            TransportKind::DirectLink => {
                let config = self.config.direct.clone();
                let link = match &self.opener {
                    Some(opener) => DirectLink::with_opener(config, Arc::clone(opener), events),
                    None => DirectLink::new(config, events),
                };
                ActiveTransport::Direct(link)
            }
            TransportKind::RelayedSocket => {
                ActiveTransport::Relayed(RelayedSocket::new(self.config.relay.clone(), events))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Command;
    use crate::transport::LinkEvent;

    #[tokio::test]
    async fn send_without_transport_is_reported() {
        let capabilities = Capabilities {
            direct_link: false,
            relayed_socket: true,
        };
        let (manager, mut rx) =
            ConnectionManager::with_capabilities(ManagerConfig::default(), capabilities);

        let err = manager.send(Command::SET_MBAR.as_bytes()).await.unwrap_err();
        assert!(matches!(err, DriverError::NotConnected));
        assert_eq!(
            rx.try_recv().ok(),
            Some(LinkEvent::Error("cannot send command: not connected".into()))
        );
    }

    #[test]
    fn capabilities_gate_each_kind() {
        let caps = Capabilities {
            direct_link: false,
            relayed_socket: true,
        };
        assert!(!caps.supports(TransportKind::DirectLink));
        assert!(caps.supports(TransportKind::RelayedSocket));
    }
}
