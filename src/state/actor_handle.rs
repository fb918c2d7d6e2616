//! ParameterStoreHandle - public API for the parameter store actor
//!
//! Wraps message passing with ergonomic async methods. Every method answers
//! through a oneshot channel; a closed actor yields `None` (or an empty value)
//! instead of an error, matching how the rest of the bridge treats a stopped
//! store during shutdown.

use tokio::sync::{mpsc, oneshot};

use super::commands::StoreCommand;
use super::types::{ChannelId, ChannelState, HardwareUpdate, SetOutcome, CHANNEL_COUNT};

/// Handle for interacting with the parameter store actor
///
/// Cheap to clone; all clones talk to the same actor.
#[derive(Clone)]
pub struct ParameterStoreHandle {
    cmd_tx: mpsc::UnboundedSender<StoreCommand>,
}

impl ParameterStoreHandle {
    pub fn new(cmd_tx: mpsc::UnboundedSender<StoreCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Spawn a new store actor and return a handle
    pub fn spawn(initial_values: [f64; CHANNEL_COUNT]) -> Self {
        super::actor::ParameterStoreActor::spawn(initial_values)
    }

    /// Current value of a channel
    pub async fn get(&self, channel: ChannelId) -> Option<f64> {
        let (response, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::Get { channel, response })
            .ok()?;
        rx.await.ok()
    }

    /// Application-originated write
    ///
    /// The value is clamped to 0.0-1.0. `changed` is false when the clamped
    /// value equals the stored one; callers skip downstream effects then.
    pub async fn set(&self, channel: ChannelId, value: f64, ts: i64) -> Option<SetOutcome> {
        let (response, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::Set {
                channel,
                value,
                ts,
                response,
            })
            .ok()?;
        rx.await.ok()
    }

    /// Hardware-originated report
    ///
    /// Stores the device-reported value and accumulates the raw delta.
    pub async fn apply_hardware_delta(
        &self,
        channel: ChannelId,
        raw_delta: i32,
        reported_value: f64,
        ts: i64,
    ) -> Option<HardwareUpdate> {
        let (response, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::ApplyHardwareDelta {
                channel,
                raw_delta,
                reported_value,
                ts,
                response,
            })
            .ok()?;
        rx.await.ok()
    }

    /// All channel values in channel order
    pub async fn values(&self) -> Option<[f64; CHANNEL_COUNT]> {
        let (response, rx) = oneshot::channel();
        self.cmd_tx.send(StoreCommand::Values { response }).ok()?;
        rx.await.ok()
    }

    /// Full state of every channel
    pub async fn snapshot(&self) -> Vec<ChannelState> {
        let (response, rx) = oneshot::channel();
        if self.cmd_tx.send(StoreCommand::Snapshot { response }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Check if the actor is still alive
    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Signal the actor to shut down
    ///
    /// Fire-and-forget: does not wait for confirmation.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(StoreCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<ParameterStoreHandle>();
    }

    #[tokio::test]
    async fn test_is_alive_when_channel_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ParameterStoreHandle::new(tx);
        assert!(handle.is_alive());
        drop(rx);
        assert!(!handle.is_alive());
        assert!(handle.snapshot().await.is_empty());
    }
}
