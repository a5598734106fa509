//! ITR 90 vacuum gauge driver.
//!
//! The gauge streams 9-byte binary frames over a 9600 baud serial line. This
//! crate turns that stream into validated [`Reading`]s and sends the gauge's
//! fixed 5-byte [`Command`]s back, either directly over the serial port or
//! through a WebSocket relay.
//!
//! # Layers
//!
//! - [`codec`]: pure frame decoding, unit conversion and the command table.
//! - [`sync`]: [`FrameSynchronizer`], finds frame boundaries in a fragmented
//!   byte stream.
//! - [`transport`]: [`DirectLink`] (serial) and [`RelayedSocket`] (WebSocket),
//!   each publishing [`LinkEvent`]s and recovering from link failures.
//! - [`manager`]: [`ConnectionManager`], one uniform front over whichever
//!   transport is available.
//! - [`bridge`]: the relay process that exposes a serial port over WebSocket.
//!
//! # Example
//! ```ignore
//! let (mut manager, mut events) = ConnectionManager::new(ManagerConfig::default());
//! manager.connect(TransportKind::DirectLink).await?;
//! manager.send(Command::SET_TORR.as_bytes()).await?;
//! while let Some(event) = events.recv().await {
//!     if let LinkEvent::Reading(r) = event {
//!         println!("{r}");
//!     }
//! }
//! ```

pub mod bridge;
pub mod codec;
pub mod errors;
pub mod link;
pub mod logging;
pub mod manager;
pub mod sync;
pub mod transport;

pub use bridge::{Bridge, BridgeConfig};
pub use codec::{Command, Emission, ErrorFlags, PressureUnit, Reading, Status};
pub use errors::*;
pub use link::{LinkHalves, LinkOpener, SerialOpener};
pub use manager::{Capabilities, ConnectionManager, ManagerConfig};
pub use sync::FrameSynchronizer;
pub use transport::{
    ConnectionState, DirectLink, DirectLinkConfig, LinkEvent, RelayConfig, RelayedSocket,
    TransportKind,
};
