//! In-memory device backend and event recorder for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use encoder_bridge::bus::{BridgeEvent, EventSink};
use encoder_bridge::config::BridgeConfig;
use encoder_bridge::error::ConnectionError;
use encoder_bridge::scheduler::TokioScheduler;
use encoder_bridge::transport::{DeviceLink, PortHandle, PortReader, PortWriter, SerialBackend};
use encoder_bridge::EncoderBridge;

pub const MOCK_PORT: &str = "/dev/ttyMOCK0";

/// A command the bridge wrote, with the (paused-clock) time it was written
#[derive(Debug, Clone)]
pub struct Written {
    pub at: Instant,
    pub text: String,
}

/// Fake serial host with one device attached
pub struct MockBackend {
    ports: Mutex<Vec<PortHandle>>,
    opens: AtomicUsize,
    fail_open: AtomicBool,
    open_delay: Mutex<Duration>,
    fail_writes: Arc<AtomicBool>,
    written: Arc<Mutex<Vec<Written>>>,
    device_tx: Mutex<Option<mpsc::UnboundedSender<io::Result<Vec<u8>>>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new(vec![PortHandle::new(MOCK_PORT).with_description("Mock Encoder")]),
            opens: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            open_delay: Mutex::new(Duration::ZERO),
            fail_writes: Arc::new(AtomicBool::new(false)),
            written: Arc::new(Mutex::new(Vec::new())),
            device_tx: Mutex::new(None),
        })
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn set_authorized(&self, ports: Vec<PortHandle>) {
        *self.ports.lock() = ports;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make `open` take this long before it resolves
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Bytes arriving from the device
    pub fn feed(&self, bytes: &[u8]) {
        if let Some(tx) = self.device_tx.lock().as_ref() {
            let _ = tx.send(Ok(bytes.to_vec()));
        }
    }

    /// Device vanishes: the read side reports end of stream
    pub fn unplug(&self) {
        self.device_tx.lock().take();
    }

    pub fn written(&self) -> Vec<Written> {
        self.written.lock().clone()
    }

    /// Written commands that start with `prefix`
    pub fn written_with_prefix(&self, prefix: &str) -> Vec<Written> {
        self.written()
            .into_iter()
            .filter(|w| w.text.starts_with(prefix))
            .collect()
    }

    pub fn clear_written(&self) {
        self.written.lock().clear();
    }
}

#[async_trait]
impl SerialBackend for MockBackend {
    async fn authorized_ports(&self) -> Result<Vec<PortHandle>, ConnectionError> {
        Ok(self.ports.lock().clone())
    }

    async fn open(&self, port: &PortHandle, _baud_rate: u32) -> Result<DeviceLink, ConnectionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_open.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unavailable {
                port: port.name.clone(),
                reason: "device busy".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.device_tx.lock() = Some(tx);

        Ok(DeviceLink {
            reader: Box::new(MockReader { rx }),
            writer: Box::new(MockWriter {
                fail: self.fail_writes.clone(),
                written: self.written.clone(),
            }),
        })
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
}

#[async_trait]
impl PortReader for MockReader {
    async fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.rx.recv().await.transpose()
    }
}

struct MockWriter {
    fail: Arc<AtomicBool>,
    written: Arc<Mutex<Vec<Written>>>,
}

#[async_trait]
impl PortWriter for MockWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        self.written.lock().push(Written {
            at: Instant::now(),
            text: String::from_utf8_lossy(bytes).into_owned(),
        });
        Ok(())
    }
}

/// Event sink that keeps everything it is given
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<BridgeEvent>>,
}

impl RecordingEvents {
    pub fn all(&self) -> Vec<BridgeEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn parameter_changes(&self) -> Vec<(String, f64, u8, f64)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::ParameterChanged {
                    parameter_name,
                    value,
                    channel_index,
                    delta,
                } => Some((parameter_name.clone(), *value, *channel_index, *delta)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEvents {
    fn publish(&self, event: BridgeEvent) {
        self.events.lock().push(event);
    }
}

pub struct Harness {
    pub bridge: EncoderBridge,
    pub backend: Arc<MockBackend>,
    pub events: Arc<RecordingEvents>,
}

impl Harness {
    pub fn new(config: BridgeConfig) -> Self {
        let backend = MockBackend::new();
        let events = Arc::new(RecordingEvents::default());
        let bridge = EncoderBridge::new(
            &config,
            backend.clone(),
            TokioScheduler::shared(),
            events.clone(),
        )
        .expect("valid config");

        Self {
            bridge,
            backend,
            events,
        }
    }

    /// Bridge with default configuration, connected and initialized
    pub async fn connected() -> Self {
        let harness = Self::new(BridgeConfig::default());
        harness.bridge.connect().await.expect("mock connect");
        settle().await;
        harness
    }
}

/// Let spawned tasks run; advances the paused clock by 1 ms
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
