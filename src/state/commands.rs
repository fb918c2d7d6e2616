//! Command enum for the parameter store actor
//!
//! Every read and mutation of channel state is expressed as a command and
//! answered through a oneshot channel, so callers observe the actor's
//! serialized view and never a torn update.

use super::types::{ChannelId, ChannelState, HardwareUpdate, SetOutcome, CHANNEL_COUNT};
use tokio::sync::oneshot;

/// Commands for the parameter store actor
#[derive(Debug)]
pub enum StoreCommand {
    /// Read a single channel value
    Get {
        channel: ChannelId,
        response: oneshot::Sender<f64>,
    },

    /// Application-originated write (clamped)
    Set {
        channel: ChannelId,
        value: f64,
        /// Wall-clock timestamp (ms) recorded as the channel's last update
        ts: i64,
        response: oneshot::Sender<SetOutcome>,
    },

    /// Hardware-originated report; the device is authoritative for its position
    ApplyHardwareDelta {
        channel: ChannelId,
        raw_delta: i32,
        reported_value: f64,
        ts: i64,
        response: oneshot::Sender<HardwareUpdate>,
    },

    /// Copy of all channel values in channel order
    Values {
        response: oneshot::Sender<[f64; CHANNEL_COUNT]>,
    },

    /// Full per-channel state snapshot
    Snapshot {
        response: oneshot::Sender<Vec<ChannelState>>,
    },

    /// Stop the actor
    Shutdown,
}
