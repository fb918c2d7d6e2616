//! SerialTransport - exclusive ownership of the open device link
//!
//! Reader and writer exist only while the state is `Open`. Writes are
//! serialized behind one async mutex; closing cancels the read loop and makes
//! an in-flight write fail fast instead of holding up the close.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ConnectionState, PortHandle, PortReader, PortWriter, SerialBackend};
use crate::error::{ConnectionError, WriteError};

/// Why the read loop ended on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkClosed {
    /// Device closed the stream
    EndOfStream,
    /// Read failed
    ReadError(String),
}

/// Receives everything the read loop produces
#[async_trait]
pub trait LinkHandler: Send + Sync {
    async fn on_chunk(&self, chunk: &[u8]);

    /// The link ended without a local `close()`
    async fn on_closed(&self, reason: LinkClosed);
}

struct LinkSlot {
    state: ConnectionState,
    port: Option<PortHandle>,
    cancel: Option<CancellationToken>,
    read_task: Option<JoinHandle<()>>,
    /// `close()` arrived while the open was in flight
    abort_open: bool,
}

/// The single open link to the device
pub struct SerialTransport {
    write_timeout: Duration,
    slot: Mutex<LinkSlot>,
    writer: tokio::sync::Mutex<Option<Box<dyn PortWriter>>>,
}

impl SerialTransport {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            write_timeout,
            slot: Mutex::new(LinkSlot {
                state: ConnectionState::Disconnected,
                port: None,
                cancel: None,
                read_task: None,
                abort_open: false,
            }),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Port of the open link
    pub fn port(&self) -> Option<PortHandle> {
        self.slot.lock().port.clone()
    }

    /// Open `port` and start the read loop
    pub async fn open(
        &self,
        backend: &dyn SerialBackend,
        port: &PortHandle,
        baud_rate: u32,
        handler: Arc<dyn LinkHandler>,
    ) -> Result<(), ConnectionError> {
        {
            let mut slot = self.slot.lock();
            match slot.state {
                ConnectionState::Disconnected => {
                    slot.state = ConnectionState::Connecting;
                    slot.abort_open = false;
                }
                ConnectionState::Connecting => return Err(ConnectionError::Busy),
                ConnectionState::Open | ConnectionState::Closing => {
                    return Err(ConnectionError::AlreadyOpen)
                }
            }
        }

        info!(port = %port, baud_rate, "Opening device link");

        let link = match backend.open(port, baud_rate).await {
            Ok(link) => link,
            Err(e) => {
                let mut slot = self.slot.lock();
                slot.state = ConnectionState::Disconnected;
                slot.abort_open = false;
                return Err(e);
            }
        };

        *self.writer.lock().await = Some(link.writer);

        {
            let mut slot = self.slot.lock();
            if !slot.abort_open {
                let cancel = CancellationToken::new();
                slot.read_task = Some(tokio::spawn(read_loop(
                    link.reader,
                    cancel.clone(),
                    handler,
                )));
                slot.state = ConnectionState::Open;
                slot.port = Some(port.clone());
                slot.cancel = Some(cancel);

                info!(port = %port, "Device link open");
                return Ok(());
            }
            slot.abort_open = false;
            slot.state = ConnectionState::Disconnected;
        }

        // Closed while opening: the new link is dropped unused
        self.writer.lock().await.take();
        info!(port = %port, "Open aborted by close");
        Err(ConnectionError::Cancelled)
    }

    /// Write bytes to the device
    ///
    /// Exclusive: concurrent callers are queued on the writer lock.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        let cancel = {
            let slot = self.slot.lock();
            match (&slot.state, &slot.cancel) {
                (ConnectionState::Open, Some(token)) => token.clone(),
                _ => return Err(WriteError::NotOpen),
            }
        };

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(WriteError::NotOpen)?;

        trace!(len = bytes.len(), "Writing to device");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WriteError::Cancelled),
            result = tokio::time::timeout(self.write_timeout, writer.write_all(bytes)) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(WriteError::Io(e)),
                Err(_) => Err(WriteError::Timeout(self.write_timeout.as_millis() as u64)),
            },
        }
    }

    /// Tear the link down
    ///
    /// Idempotent. Returns true if an open link was closed. An open still in
    /// flight is aborted instead: it fails with `ConnectionError::Cancelled`
    /// and this returns false.
    pub async fn close(&self) -> bool {
        let (cancel, read_task) = {
            let mut slot = self.slot.lock();
            match slot.state {
                ConnectionState::Open => {}
                ConnectionState::Connecting => {
                    debug!("Close requested while opening, aborting open");
                    slot.abort_open = true;
                    return false;
                }
                ConnectionState::Disconnected | ConnectionState::Closing => return false,
            }
            slot.state = ConnectionState::Closing;
            (slot.cancel.take(), slot.read_task.take())
        };

        if let Some(token) = cancel {
            token.cancel();
        }
        // The read loop may be the caller (via on_closed); it exits on its own
        // once the token is observed.
        drop(read_task);

        self.writer.lock().await.take();

        let mut slot = self.slot.lock();
        slot.state = ConnectionState::Disconnected;
        if let Some(port) = slot.port.take() {
            info!(port = %port, "Device link closed");
        }
        true
    }
}

async fn read_loop(
    mut reader: Box<dyn PortReader>,
    cancel: CancellationToken,
    handler: Arc<dyn LinkHandler>,
) {
    debug!("Read loop started");

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Read loop cancelled");
                return;
            }
            result = reader.read_chunk() => match result {
                Ok(Some(chunk)) => {
                    trace!(len = chunk.len(), "Received chunk");
                    handler.on_chunk(&chunk).await;
                }
                Ok(None) => break LinkClosed::EndOfStream,
                Err(e) => break LinkClosed::ReadError(e.to_string()),
            },
        }
    };

    if cancel.is_cancelled() {
        return;
    }

    warn!(?reason, "Device link ended unexpectedly");
    handler.on_closed(reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeviceLink;
    use std::io;
    use tokio::sync::mpsc;

    struct ChannelReader(mpsc::UnboundedReceiver<io::Result<Vec<u8>>>);

    #[async_trait]
    impl PortReader for ChannelReader {
        async fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
            match self.0.recv().await {
                Some(Ok(bytes)) => Ok(Some(bytes)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }
    }

    struct VecWriter(Arc<Mutex<Vec<u8>>>, bool);

    #[async_trait]
    impl PortWriter for VecWriter {
        async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.1 {
                // Never completes
                std::future::pending::<()>().await;
            }
            self.0.lock().extend_from_slice(bytes);
            Ok(())
        }
    }

    struct Backend {
        feed: Mutex<Option<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>>,
        written: Arc<Mutex<Vec<u8>>>,
        stall_writes: bool,
        open_delay: Duration,
    }

    #[async_trait]
    impl SerialBackend for Backend {
        async fn authorized_ports(&self) -> Result<Vec<PortHandle>, ConnectionError> {
            Ok(vec![PortHandle::new("mock0")])
        }

        async fn open(&self, port: &PortHandle, _baud: u32) -> Result<DeviceLink, ConnectionError> {
            tokio::time::sleep(self.open_delay).await;
            let rx = self.feed.lock().take().ok_or_else(|| ConnectionError::Unavailable {
                port: port.name.clone(),
                reason: "busy".into(),
            })?;
            Ok(DeviceLink {
                reader: Box::new(ChannelReader(rx)),
                writer: Box::new(VecWriter(self.written.clone(), self.stall_writes)),
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        chunks: Mutex<Vec<Vec<u8>>>,
        closed: Mutex<Vec<LinkClosed>>,
    }

    #[async_trait]
    impl LinkHandler for Recorder {
        async fn on_chunk(&self, chunk: &[u8]) {
            self.chunks.lock().push(chunk.to_vec());
        }

        async fn on_closed(&self, reason: LinkClosed) {
            self.closed.lock().push(reason);
        }
    }

    fn backend(stall_writes: bool) -> (Backend, mpsc::UnboundedSender<io::Result<Vec<u8>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Backend {
            feed: Mutex::new(Some(rx)),
            written: Arc::new(Mutex::new(Vec::new())),
            stall_writes,
            open_delay: Duration::ZERO,
        };
        (backend, tx)
    }

    #[tokio::test]
    async fn test_write_requires_open_link() {
        let transport = SerialTransport::new(Duration::from_millis(100));
        assert!(matches!(transport.write(b"x").await, Err(WriteError::NotOpen)));
    }

    #[tokio::test]
    async fn test_open_write_and_read() {
        let (backend, feed) = backend(false);
        let transport = SerialTransport::new(Duration::from_millis(100));
        let recorder = Arc::new(Recorder::default());

        transport
            .open(&backend, &PortHandle::new("mock0"), 115_200, recorder.clone())
            .await
            .unwrap();
        assert_eq!(transport.state(), ConnectionState::Open);

        transport.write(b"reset();\r\n").await.unwrap();
        assert_eq!(backend.written.lock().as_slice(), b"reset();\r\n");

        feed.send(Ok(b"ENC:1".to_vec())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.chunks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_second_open_is_rejected() {
        let (backend, _feed) = backend(false);
        let transport = SerialTransport::new(Duration::from_millis(100));
        let recorder = Arc::new(Recorder::default());
        let port = PortHandle::new("mock0");

        transport.open(&backend, &port, 115_200, recorder.clone()).await.unwrap();
        let err = transport.open(&backend, &port, 115_200, recorder).await.unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyOpen));
    }

    #[tokio::test]
    async fn test_failed_open_returns_to_disconnected() {
        let (backend, _feed) = backend(false);
        backend.feed.lock().take();
        let transport = SerialTransport::new(Duration::from_millis(100));

        let err = transport
            .open(&backend, &PortHandle::new("mock0"), 115_200, Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Unavailable { .. }));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silent() {
        let (backend, _feed) = backend(false);
        let transport = SerialTransport::new(Duration::from_millis(100));
        let recorder = Arc::new(Recorder::default());

        transport
            .open(&backend, &PortHandle::new("mock0"), 115_200, recorder.clone())
            .await
            .unwrap();

        assert!(transport.close().await);
        assert!(!transport.close().await);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(transport.port().is_none());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(recorder.closed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_end_of_stream_reports_closed() {
        let (backend, feed) = backend(false);
        let transport = SerialTransport::new(Duration::from_millis(100));
        let recorder = Arc::new(Recorder::default());

        transport
            .open(&backend, &PortHandle::new("mock0"), 115_200, recorder.clone())
            .await
            .unwrap();

        drop(feed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.closed.lock().as_slice(), &[LinkClosed::EndOfStream]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let (backend, _feed) = backend(true);
        let transport = SerialTransport::new(Duration::from_millis(250));

        transport
            .open(&backend, &PortHandle::new("mock0"), 115_200, Arc::new(Recorder::default()))
            .await
            .unwrap();

        let err = transport.write(b"x").await.unwrap_err();
        assert!(matches!(err, WriteError::Timeout(250)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_inflight_write() {
        let (backend, _feed) = backend(true);
        let transport = Arc::new(SerialTransport::new(Duration::from_secs(60)));

        transport
            .open(&backend, &PortHandle::new("mock0"), 115_200, Arc::new(Recorder::default()))
            .await
            .unwrap();

        let writer = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.write(b"x").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(transport.close().await);
        let result = writer.await.unwrap();
        assert!(matches!(result, Err(WriteError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_opening_aborts_the_open() {
        let (mut slow, _slow_feed) = backend(false);
        slow.open_delay = Duration::from_millis(500);
        let slow = Arc::new(slow);
        let transport = Arc::new(SerialTransport::new(Duration::from_millis(100)));
        let recorder = Arc::new(Recorder::default());

        let opening = {
            let (slow, transport, recorder) = (slow.clone(), transport.clone(), recorder.clone());
            tokio::spawn(async move {
                transport
                    .open(slow.as_ref(), &PortHandle::new("mock0"), 115_200, recorder)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.state(), ConnectionState::Connecting);

        assert!(!transport.close().await);

        let result = opening.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(transport.port().is_none());
        assert!(matches!(transport.write(b"x").await, Err(WriteError::NotOpen)));

        // The link is usable again afterwards
        let (backend, _feed) = backend(false);
        transport
            .open(&backend, &PortHandle::new("mock0"), 115_200, recorder.clone())
            .await
            .unwrap();
        assert_eq!(transport.state(), ConnectionState::Open);
        assert!(recorder.closed.lock().is_empty());
    }
}
