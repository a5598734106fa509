//! Serial link plumbing shared by [`DirectLink`](crate::transport::DirectLink)
//! and the relay [`bridge`](crate::bridge).
//!
//! Opening a link yields independent read and write halves so commands can be
//! written while a blocking read is parked on a worker thread.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, info};
use serialport::{DataBits, FlowControl, Parity, SerialPortType, StopBits};

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// ITR 90 serial baud rate.
pub const BAUD_RATE: u32 = 9600;

/// Read timeout on the port; keeps blocking reads short so cancellation is
/// observed quickly.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest chunk handed to the synchronizer per read.
const CHUNK_SIZE: usize = 256;

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Read half of an open link.
pub trait LinkReader: Read + Send {}
impl<T: Read + Send> LinkReader for T {}

/// Write half of an open link.
pub trait LinkWriter: Write + Send {}
impl<T: Write + Send> LinkWriter for T {}

/// An open link, split into halves.
pub struct LinkHalves {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

/// Something that can (re)open the physical link.
///
/// The serial implementation is [`SerialOpener`]; tests substitute in-memory
/// links.
pub trait LinkOpener: Send + Sync {
    fn open(&self) -> Result<LinkHalves>;

    /// Human-readable name of the link for logs.
    fn describe(&self) -> String;
}

// ============================================================================
// Serial
// ============================================================================

/// Opens a serial port at 9600 8N1, no flow control.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    /// Port path; `None` auto-selects the only available port.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for SerialOpener {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl SerialOpener {
    pub fn new(port: Option<String>) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    fn resolve_port(&self) -> Result<String> {
        match &self.port {
            Some(p) => Ok(p.clone()),
            None => select_single_port(discover_ports()?),
        }
    }
}

impl LinkOpener for SerialOpener {
    fn open(&self) -> Result<LinkHalves> {
        let path = self.resolve_port()?;
        debug!("opening serial port: path={}, baud={}", path, self.baud_rate);

        let port = serialport::new(&path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(self.read_timeout)
            .open()?;
        let writer = port.try_clone()?;

        info!("serial port opened: path={}", path);
        Ok(LinkHalves {
            reader: Box::new(port),
            writer: Box::new(writer),
        })
    }

    fn describe(&self) -> String {
        match &self.port {
            Some(p) => format!("serial {p}"),
            None => "serial (auto)".to_string(),
        }
    }
}

/// A serial port found on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// List serial ports available on this machine.
pub fn discover_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                SerialPortType::UsbPort(usb) => {
                    let product = usb.product.unwrap_or_else(|| "USB serial".to_string());
                    format!("{product} ({:04x}:{:04x})", usb.vid, usb.pid)
                }
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::Unknown => "unknown".to_string(),
            };
            PortInfo {
                name: p.port_name,
                description,
            }
        })
        .collect())
}

/// Pick the port to use when none was configured.
pub fn select_single_port(ports: Vec<PortInfo>) -> Result<String> {
    match ports.len() {
        0 => Err(DriverError::Discovery("no serial ports found".into())),
        1 => {
            let port = ports.into_iter().next().map(|p| p.name).unwrap_or_default();
            info!("auto-selected serial port: {}", port);
            Ok(port)
        }
        n => {
            let names: Vec<_> = ports.iter().map(|p| p.name.as_str()).collect();
            Err(DriverError::Discovery(format!(
                "{n} serial ports found ({}), specify one",
                names.join(", ")
            )))
        }
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Outcome of one blocking read.
#[derive(Debug)]
pub enum Chunk {
    Data(Vec<u8>),
    /// Read timed out with nothing available.
    Idle,
    /// The link reported end of stream.
    Eof,
    Failed(io::Error),
}

/// Run one blocking read on the blocking pool and hand the reader back.
pub async fn read_chunk(mut reader: Box<dyn LinkReader>) -> (Box<dyn LinkReader>, Chunk) {
    let joined = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; CHUNK_SIZE];
        let chunk = match reader.read(&mut buf) {
            Ok(0) => Chunk::Eof,
            Ok(n) => Chunk::Data(buf[..n].to_vec()),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Chunk::Idle
            }
            Err(e) => Chunk::Failed(e),
        };
        (reader, chunk)
    })
    .await;

    match joined {
        Ok(result) => result,
        // runtime shutting down, the reader went with it
        Err(e) => (
            Box::new(io::empty()),
            Chunk::Failed(io::Error::other(e.to_string())),
        ),
    }
}

/// Write a whole command and flush.
pub fn write_command(writer: &mut dyn LinkWriter, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str) -> PortInfo {
        PortInfo {
            name: name.into(),
            description: String::new(),
        }
    }

    #[test]
    fn single_port_is_selected() {
        assert_eq!(
            select_single_port(vec![port("/dev/ttyUSB0")]).ok(),
            Some("/dev/ttyUSB0".to_string())
        );
    }

    #[test]
    fn zero_or_many_ports_is_an_error() {
        assert!(matches!(
            select_single_port(vec![]),
            Err(DriverError::Discovery(_))
        ));
        let err = select_single_port(vec![port("COM3"), port("COM4")]).unwrap_err();
        assert!(err.to_string().contains("COM3, COM4"));
    }

    #[tokio::test]
    async fn read_chunk_maps_outcomes() {
        let reader: Box<dyn LinkReader> = Box::new(io::Cursor::new(vec![7u8, 5, 1]));
        let (reader, chunk) = read_chunk(reader).await;
        assert!(matches!(chunk, Chunk::Data(ref d) if d == &[7, 5, 1]));

        let (_, chunk) = read_chunk(reader).await;
        assert!(matches!(chunk, Chunk::Eof));
    }
}
