//! Device transport - serial backend abstraction and the exclusive link
//!
//! A [`SerialBackend`] knows how to enumerate authorized ports and open one;
//! the [`SerialTransport`] owns whatever link is currently open: the single
//! writer, the read loop and the connection state.

mod link;
mod serial_port;

pub use link::{LinkClosed, LinkHandler, SerialTransport};
pub use serial_port::{list_ports, PortFilter, SystemSerialBackend};

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::error::ConnectionError;

/// Default link speed of the encoder controller
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// A host serial port the bridge may open
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortHandle {
    pub name: String,
    pub description: Option<String>,
}

impl PortHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(desc) => write!(f, "{} ({})", self.name, desc),
            None => f.write_str(&self.name),
        }
    }
}

/// Receiving half of an open link
#[async_trait]
pub trait PortReader: Send {
    /// Next chunk of bytes; `Ok(None)` when the device closed the stream
    async fn read_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>>;
}

/// Sending half of an open link
#[async_trait]
pub trait PortWriter: Send {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

/// Reader and writer of a freshly opened port
pub struct DeviceLink {
    pub reader: Box<dyn PortReader>,
    pub writer: Box<dyn PortWriter>,
}

/// Host-side access to serial devices
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// Ports the host has previously been allowed to use
    async fn authorized_ports(&self) -> Result<Vec<PortHandle>, ConnectionError>;

    /// Open a port at the given speed
    async fn open(&self, port: &PortHandle, baud_rate: u32) -> Result<DeviceLink, ConnectionError>;
}
