//! Encoder bridge service
//!
//! Ties the pieces together:
//!
//! ```text
//! device bytes ─► SerialTransport read loop ─► HardwareReader (framer + codec)
//!                                                   │
//!                                                   ▼
//!                      ParameterStore ◄── apply_hardware_delta ──► parameterChanged
//!
//! applicationParameterChanged ─► ParameterStore.set ─► LedThrottler ─► codec ─► write
//! ```
//!
//! Everything external (serial backend, clock, event sink) is injected, so
//! the whole service runs against in-memory fakes in tests.

mod reader;
mod reconnect;

pub use reconnect::{ReconnectAttempt, ReconnectOrigin, ReconnectSupervisor};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{ApplicationCommand, BridgeEvent, EventSink};
use crate::config::BridgeConfig;
use crate::error::{ConnectionError, WriteError};
use crate::led_throttle::{FeedbackSink, LedThrottler, ThrottleStats};
use crate::protocol::{encode_init, encode_led_update, ChannelDelta, DeviceScript};
use crate::scheduler::Scheduler;
use crate::state::{ChannelId, ChannelState, ParameterStoreHandle, SetOutcome, CHANNEL_COUNT};
use crate::transport::{
    ConnectionState, LinkClosed, PortHandle, SerialBackend, SerialTransport,
};
use reader::HardwareReader;

/// Why a link went down
#[derive(Debug, Clone)]
pub enum DisconnectCause {
    /// A write failed or timed out
    WriteFailed(String),
    /// The read loop ended on its own
    Link(LinkClosed),
}

/// Snapshot returned by [`EncoderBridge::status`]
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub connection: ConnectionState,
    pub port: Option<PortHandle>,
    pub reconnect_pending: bool,
    pub reconnect_suppressed: bool,
    pub channels: Vec<ChannelState>,
    pub feedback: ThrottleStats,
}

/// The bridge service
///
/// Cheap to clone; all clones drive the same connection and state.
#[derive(Clone)]
pub struct EncoderBridge {
    inner: Arc<BridgeInner>,
}

pub(crate) struct BridgeInner {
    baud_rate: u32,
    init_pacing: Duration,
    script: DeviceScript,
    backend: Arc<dyn SerialBackend>,
    scheduler: Arc<dyn Scheduler>,
    events: Arc<dyn EventSink>,
    store: ParameterStoreHandle,
    transport: SerialTransport,
    throttler: LedThrottler,
    supervisor: ReconnectSupervisor,
    /// Serializes open attempts
    connect_lock: tokio::sync::Mutex<()>,
    /// Set once the current link has been announced with `hardwareConnected`
    link_ready: Mutex<bool>,
    /// Bumped by every user disconnect; an attempt that sees it change gives up
    disconnect_epoch: AtomicU64,
    shutdown: CancellationToken,
}

impl EncoderBridge {
    /// Build the service; spawns the parameter store actor
    pub fn new(
        config: &BridgeConfig,
        backend: Arc<dyn SerialBackend>,
        scheduler: Arc<dyn Scheduler>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let initial = config.initial_values()?;

        let inner = Arc::new_cyclic(|weak: &Weak<BridgeInner>| {
            let sink: Arc<dyn FeedbackSink> = Arc::new(LinkFeedback {
                bridge: weak.clone(),
            });

            BridgeInner {
                baud_rate: config.serial.baud_rate,
                init_pacing: Duration::from_millis(config.feedback.init_pacing_ms),
                script: config.device_script(),
                backend,
                scheduler: scheduler.clone(),
                events,
                store: ParameterStoreHandle::spawn(initial),
                transport: SerialTransport::new(Duration::from_millis(
                    config.serial.write_timeout_ms,
                )),
                throttler: LedThrottler::new(config.throttle_settings(), scheduler.clone(), sink),
                supervisor: ReconnectSupervisor::new(
                    config.reconnect.enabled,
                    Duration::from_millis(config.reconnect.delay_ms),
                    scheduler,
                ),
                connect_lock: tokio::sync::Mutex::new(()),
                link_ready: Mutex::new(false),
                disconnect_epoch: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }
        });

        Ok(Self { inner })
    }

    /// Connect to the first authorized device (user-initiated)
    ///
    /// Clears a previous user suppression of automatic reconnects. Failures
    /// are also published as `hardwareConnectionError`.
    pub async fn connect(&self) -> Result<PortHandle, ConnectionError> {
        let inner = &self.inner;
        inner.supervisor.clear_suppression();
        let epoch = inner.epoch();

        let result = match inner.first_authorized_port().await {
            Ok(port) => inner
                .establish(&port, ReconnectOrigin::User, epoch)
                .await
                .map(|()| port),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            inner.report_connection_error(e);
        }
        result
    }

    /// Connect to a named port, bypassing the authorized list
    pub async fn connect_to(&self, port_name: &str) -> Result<PortHandle, ConnectionError> {
        let inner = &self.inner;
        inner.supervisor.clear_suppression();
        let epoch = inner.epoch();

        let port = PortHandle::new(port_name);
        let result = inner.establish(&port, ReconnectOrigin::User, epoch).await;

        match result {
            Ok(()) => Ok(port),
            Err(e) => {
                inner.report_connection_error(&e);
                Err(e)
            }
        }
    }

    /// User-initiated disconnect
    ///
    /// Suppresses automatic reconnects until the next `connect` and cancels
    /// any open or init sequence in flight. `hardwareDisconnected` is only
    /// published for a link that was announced. Returns whether a link was
    /// open.
    pub async fn disconnect(&self) -> bool {
        let inner = &self.inner;
        inner.supervisor.suppress();
        inner.disconnect_epoch.fetch_add(1, Ordering::SeqCst);

        let closed = inner.transport.close().await;
        let announced = std::mem::replace(&mut *inner.link_ready.lock(), false);

        if closed {
            inner.throttler.reset(None);
        }
        if announced {
            info!("Disconnected by user");
            inner.events.publish(BridgeEvent::HardwareDisconnected {
                timestamp: inner.scheduler.timestamp_ms(),
            });
        } else if closed {
            info!("Connection attempt cancelled by user");
        }
        closed
    }

    /// Route an inbound application command
    pub async fn handle_command(&self, command: ApplicationCommand) {
        match command {
            ApplicationCommand::ApplicationParameterChanged {
                parameter_name,
                value,
            } => {
                self.set_parameter(&parameter_name, value).await;
            }
        }
    }

    /// Application-originated parameter write
    ///
    /// Stores the clamped value and, if it changed, requests LED feedback.
    /// Unknown names and NaN are ignored.
    pub async fn set_parameter(&self, name: &str, value: f64) -> Option<SetOutcome> {
        let Some(channel) = ChannelId::from_name(name) else {
            warn!(parameter = name, "Unknown parameter name, ignoring");
            return None;
        };
        if value.is_nan() {
            warn!(parameter = name, "Ignoring NaN parameter value");
            return None;
        }

        let inner = &self.inner;
        let outcome = inner
            .store
            .set(channel, value, inner.scheduler.timestamp_ms())
            .await?;

        if outcome.changed {
            inner.throttler.request(channel, outcome.value).await;
        } else {
            debug!(%channel, value = outcome.value, "Parameter unchanged");
        }

        Some(outcome)
    }

    /// Current value of a named parameter
    pub async fn get(&self, name: &str) -> Option<f64> {
        let channel = ChannelId::from_name(name)?;
        self.inner.store.get(channel).await
    }

    pub async fn values(&self) -> Option<[f64; CHANNEL_COUNT]> {
        self.inner.store.values().await
    }

    pub async fn status(&self) -> BridgeStatus {
        let inner = &self.inner;
        BridgeStatus {
            connection: inner.transport.state(),
            port: inner.transport.port(),
            reconnect_pending: inner.supervisor.pending().is_some(),
            reconnect_suppressed: inner.supervisor.is_suppressed(),
            channels: inner.store.snapshot().await,
            feedback: inner.throttler.stats(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    /// Pending automatic reconnect, if any
    pub fn pending_reconnect(&self) -> Option<ReconnectAttempt> {
        self.inner.supervisor.pending()
    }

    /// Consume application commands until shutdown
    pub fn spawn_command_listener(
        &self,
        mut commands: broadcast::Receiver<ApplicationCommand>,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            debug!("Command listener started");
            loop {
                let command = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = commands.recv() => received,
                };

                match command {
                    Ok(command) => bridge.handle_command(command).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Command listener lagged, dropped commands");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Command listener stopped");
        })
    }

    /// Startup: connect automatically if configured
    pub async fn start(&self, auto_connect: bool) {
        if !auto_connect {
            info!("Auto-connect disabled, waiting for manual connection");
            return;
        }

        match self.connect().await {
            Ok(port) => info!(port = %port, "Connected at startup"),
            Err(ConnectionError::NoAuthorizedDevice) => {
                info!("No authorized device found, manual connection required");
            }
            Err(ConnectionError::Cancelled) => info!("Startup connection cancelled"),
            Err(e) => warn!(error = %e, "Startup connection failed"),
        }
    }

    /// Stop listeners, close the link and stop the store
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        self.inner.shutdown.cancel();
        self.disconnect().await;
        self.inner.store.shutdown();
    }
}

impl BridgeInner {
    fn epoch(&self) -> u64 {
        self.disconnect_epoch.load(Ordering::SeqCst)
    }

    /// Whether a user disconnect happened since `epoch` was taken
    fn cancelled_since(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }

    async fn first_authorized_port(&self) -> Result<PortHandle, ConnectionError> {
        self.backend
            .authorized_ports()
            .await?
            .into_iter()
            .next()
            .ok_or(ConnectionError::NoAuthorizedDevice)
    }

    /// Open `port`, run the init sequence and announce the connection
    ///
    /// `epoch` is the disconnect epoch the caller started from; a user
    /// disconnect after it aborts the attempt with `Cancelled`.
    async fn establish(
        self: &Arc<Self>,
        port: &PortHandle,
        origin: ReconnectOrigin,
        epoch: u64,
    ) -> Result<(), ConnectionError> {
        let _guard = self
            .connect_lock
            .try_lock()
            .map_err(|_| ConnectionError::Busy)?;

        if self.cancelled_since(epoch) {
            return Err(ConnectionError::Cancelled);
        }

        info!(port = %port, ?origin, "Connecting");

        let handler = Arc::new(HardwareReader::new(Arc::downgrade(self)));
        self.transport
            .open(self.backend.as_ref(), port, self.baud_rate, handler)
            .await?;
        *self.link_ready.lock() = false;

        if self.cancelled_since(epoch) {
            self.transport.close().await;
            return Err(ConnectionError::Cancelled);
        }

        let seeded = self.store.values().await.unwrap_or_default();

        for (i, command) in encode_init(&self.script, &seeded).iter().enumerate() {
            if i > 0 {
                self.scheduler.sleep(self.init_pacing).await;
            }
            if let Err(e) = self.send_command(command).await {
                if self.cancelled_since(epoch) {
                    return Err(ConnectionError::Cancelled);
                }
                self.transport.close().await;
                return Err(ConnectionError::Unavailable {
                    port: port.name.clone(),
                    reason: format!("initialization failed: {e}"),
                });
            }
        }

        self.throttler.reset(Some(seeded));

        // A concurrent disconnect either sees the announcement or prevents it
        let announced = {
            let mut ready = self.link_ready.lock();
            let live = !self.cancelled_since(epoch) && self.transport.is_open();
            if live {
                *ready = true;
                info!(port = %port, "Device initialized");
                self.events.publish(BridgeEvent::HardwareConnected {
                    timestamp: self.scheduler.timestamp_ms(),
                    parameter_values: seeded,
                });
            }
            live
        };

        if !announced {
            self.transport.close().await;
            if self.cancelled_since(epoch) {
                return Err(ConnectionError::Cancelled);
            }
            return Err(ConnectionError::Unavailable {
                port: port.name.clone(),
                reason: "link lost during initialization".into(),
            });
        }

        // Application writes that landed during init were not sent
        if let Some(current) = self.store.values().await {
            for channel in ChannelId::all() {
                let value = current[channel.index()];
                if value != seeded[channel.index()] {
                    self.throttler.request(channel, value).await;
                }
            }
        }

        Ok(())
    }

    /// Write one encoded command; a failure tears the link down
    async fn send_command(self: &Arc<Self>, command: &str) -> Result<(), WriteError> {
        debug!(command = command.trim_end(), "Sending to device");

        match self.transport.write(command.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(e @ (WriteError::NotOpen | WriteError::Cancelled)) => Err(e),
            Err(e) => {
                warn!(error = %e, "Write to device failed");
                self.handle_disconnect(DisconnectCause::WriteFailed(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Unexpected loss of the link
    ///
    /// Only a link that was announced is reported and reconnected; a loss
    /// during the init sequence fails that connection attempt instead.
    async fn handle_disconnect(self: &Arc<Self>, cause: DisconnectCause) {
        let closed = self.transport.close().await;
        let announced = std::mem::replace(&mut *self.link_ready.lock(), false);

        if !announced {
            if closed {
                debug!(?cause, "Link lost during initialization");
            } else {
                debug!(?cause, "Link already closed");
            }
            return;
        }

        warn!(?cause, "Device disconnected");
        self.throttler.reset(None);
        self.events.publish(BridgeEvent::HardwareDisconnected {
            timestamp: self.scheduler.timestamp_ms(),
        });

        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let weak = Arc::downgrade(self);
        self.supervisor.schedule(Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                inner.reconnect_attempt().await;
            }
        }));
    }

    /// One automatic reopen; a failure is reported and left for manual retry
    async fn reconnect_attempt(self: Arc<Self>) {
        let Some(attempt) = self.supervisor.begin_attempt() else {
            return;
        };
        if self.shutdown.is_cancelled() || self.transport.is_open() {
            return;
        }
        let epoch = self.epoch();

        info!(origin = ?attempt.origin, "Attempting reconnect");

        let ports = match self.backend.authorized_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                warn!(error = %e, "Could not list authorized devices, manual connection required");
                self.report_connection_error(&e);
                return;
            }
        };

        let Some(port) = ports.into_iter().next() else {
            warn!("No authorized device found, manual connection required");
            return;
        };

        match self.establish(&port, ReconnectOrigin::Automatic, epoch).await {
            Ok(()) => info!(port = %port, "Reconnected"),
            Err(
                ConnectionError::Busy | ConnectionError::AlreadyOpen | ConnectionError::Cancelled,
            ) => {
                debug!("Connection handled elsewhere, dropping reconnect attempt");
            }
            Err(e) => {
                warn!(error = %e, "Reconnect failed, manual connection required");
                self.report_connection_error(&e);
            }
        }
    }

    async fn apply_hardware_delta(&self, delta: ChannelDelta) {
        let Some(update) = self
            .store
            .apply_hardware_delta(
                delta.channel,
                delta.raw_delta,
                delta.value,
                self.scheduler.timestamp_ms(),
            )
            .await
        else {
            return;
        };

        debug!(
            channel = %delta.channel,
            raw_delta = delta.raw_delta,
            value = update.value,
            "Encoder moved"
        );

        self.events.publish(BridgeEvent::ParameterChanged {
            parameter_name: delta.channel.name().to_string(),
            value: update.value,
            channel_index: delta.channel.index() as u8,
            delta: f64::from(delta.raw_delta) * self.script.encoder_step,
        });
    }

    fn report_connection_error(&self, error: &ConnectionError) {
        if matches!(
            error,
            ConnectionError::Busy | ConnectionError::AlreadyOpen | ConnectionError::Cancelled
        ) {
            return;
        }
        self.events.publish(BridgeEvent::HardwareConnectionError {
            message: error.to_string(),
        });
    }
}

/// LED feedback path into the open link
struct LinkFeedback {
    bridge: Weak<BridgeInner>,
}

#[async_trait]
impl FeedbackSink for LinkFeedback {
    async fn send_led(&self, channel: ChannelId, value: f64) -> bool {
        let Some(bridge) = self.bridge.upgrade() else {
            return false;
        };
        if !*bridge.link_ready.lock() {
            debug!(%channel, "Link not ready, LED update not sent");
            return false;
        }
        bridge
            .send_command(&encode_led_update(channel, value))
            .await
            .is_ok()
    }
}
