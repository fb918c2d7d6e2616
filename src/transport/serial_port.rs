//! Host serial ports via the `serialport` crate
//!
//! `serialport` is blocking, so the port is split in two: a dedicated reader
//! thread polls with a short timeout and forwards chunks over a channel, and
//! writes run on the blocking pool against a cloned handle.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::{DeviceLink, PortHandle, PortReader, PortWriter, SerialBackend};
use crate::error::ConnectionError;

/// How long a blocking read waits before checking whether the link is gone
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);

const READ_BUFFER_SIZE: usize = 256;

/// Buffered chunks between the reader thread and the read loop
const READ_CHANNEL_CAPACITY: usize = 64;

/// All serial ports the host reports
pub fn list_ports() -> Result<Vec<PortHandle>, ConnectionError> {
    let ports = serialport::available_ports()
        .map_err(|e| ConnectionError::Enumeration(e.to_string()))?;

    Ok(ports.into_iter().map(port_handle).collect())
}

fn port_handle(info: serialport::SerialPortInfo) -> PortHandle {
    let handle = PortHandle::new(info.port_name);
    match info.port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            let desc = match (usb.manufacturer, usb.product) {
                (Some(m), Some(p)) => format!("{m} {p}"),
                (Some(m), None) => m,
                (None, Some(p)) => p,
                (None, None) => format!("USB {:04x}:{:04x}", usb.vid, usb.pid),
            };
            handle.with_description(desc)
        }
        serialport::SerialPortType::BluetoothPort => handle.with_description("Bluetooth"),
        _ => handle,
    }
}

/// Which ports count as previously authorized
///
/// An exact port name wins; otherwise the pattern is matched
/// case-insensitively against the port name and its description.
#[derive(Debug, Clone, Default)]
pub struct PortFilter {
    pub port: Option<String>,
    pub pattern: Option<String>,
}

impl PortFilter {
    pub fn matches(&self, handle: &PortHandle) -> bool {
        if let Some(port) = &self.port {
            return handle.name == *port;
        }

        match &self.pattern {
            Some(pattern) if !pattern.is_empty() => {
                let needle = pattern.to_lowercase();
                handle.name.to_lowercase().contains(&needle)
                    || handle
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            }
            _ => false,
        }
    }

    pub fn select(&self, available: Vec<PortHandle>) -> Vec<PortHandle> {
        available.into_iter().filter(|h| self.matches(h)).collect()
    }
}

/// Backend using the host's real serial ports
pub struct SystemSerialBackend {
    filter: PortFilter,
}

impl SystemSerialBackend {
    pub fn new(filter: PortFilter) -> Self {
        Self { filter }
    }
}

#[async_trait]
impl SerialBackend for SystemSerialBackend {
    async fn authorized_ports(&self) -> Result<Vec<PortHandle>, ConnectionError> {
        let available = tokio::task::spawn_blocking(list_ports)
            .await
            .map_err(|e| ConnectionError::Enumeration(e.to_string()))??;

        let authorized = self.filter.select(available);
        debug!(count = authorized.len(), "Authorized ports");
        Ok(authorized)
    }

    async fn open(&self, port: &PortHandle, baud_rate: u32) -> Result<DeviceLink, ConnectionError> {
        let name = port.name.clone();
        let unavailable = |reason: String| ConnectionError::Unavailable {
            port: port.name.clone(),
            reason,
        };

        let serial = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud_rate)
                .timeout(READ_POLL_TIMEOUT)
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .open()
        })
        .await
        .map_err(|e| unavailable(e.to_string()))?
        .map_err(|e| unavailable(e.to_string()))?;

        let read_half = serial.try_clone().map_err(|e| unavailable(e.to_string()))?;

        let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        std::thread::Builder::new()
            .name(format!("serial-read-{}", port.name))
            .spawn(move || reader_thread(read_half, tx))
            .map_err(|e| unavailable(e.to_string()))?;

        info!(port = %port, baud_rate, "Serial port opened");

        Ok(DeviceLink {
            reader: Box::new(SerialReader { rx }),
            writer: Box::new(SerialWriter {
                port: Arc::new(Mutex::new(serial)),
            }),
        })
    }
}

/// Blocking read loop; exits when the async side drops its receiver
fn reader_thread(
    mut port: Box<dyn serialport::SerialPort>,
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        if tx.is_closed() {
            break;
        }

        match port.read(&mut buf) {
            Ok(0) => {
                // Device gone; dropping tx ends the stream
                break;
            }
            Ok(n) => {
                if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }

    trace!("Serial reader thread exiting");
}

struct SerialReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
}

#[async_trait]
impl PortReader for SerialReader {
    async fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.rx.recv().await.transpose()
    }
}

struct SerialWriter {
    port: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
}

#[async_trait]
impl PortWriter for SerialWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = Arc::clone(&self.port);
        let data = bytes.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut port = port.lock();
            port.write_all(&data)?;
            port.flush()
        })
        .await
        .map_err(io::Error::other)?
    }
}
