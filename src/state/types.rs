//! Parameter state type definitions
//!
//! Defines the channel identity, per-channel state and the snapshot types
//! handed out by the parameter store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of encoder channels on the device
pub const CHANNEL_COUNT: usize = 4;

/// Fixed parameter name for each channel, in channel order
pub const CHANNEL_NAMES: [&str; CHANNEL_COUNT] = ["volume", "brightness", "detune", "reverb"];

/// Value every channel starts at
pub const DEFAULT_CHANNEL_VALUE: f64 = 0.5;

/// A validated channel index (0-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ChannelId(u8);

impl ChannelId {
    /// Build a channel id, rejecting indices outside 0-3
    pub fn new(index: u8) -> Option<Self> {
        ((index as usize) < CHANNEL_COUNT).then_some(Self(index))
    }

    /// Look up a channel by its parameter name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        CHANNEL_NAMES
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name.trim()))
            .map(|idx| Self(idx as u8))
    }

    /// All channels in fixed order
    pub fn all() -> impl Iterator<Item = ChannelId> {
        (0..CHANNEL_COUNT as u8).map(Self)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn name(self) -> &'static str {
        CHANNEL_NAMES[self.index()]
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("channel index {value} out of range"))
    }
}

impl From<ChannelId> for u8 {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name(), self.0)
    }
}

/// State of a single channel, owned by the store actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub id: ChannelId,
    /// Normalized value, always within 0.0-1.0
    pub value: f64,
    /// Sum of all raw encoder deltas received (diagnostics)
    pub cumulative_delta: i64,
    /// Wall-clock time of the last mutation (milliseconds since epoch)
    pub last_update_ms: Option<i64>,
}

impl ChannelState {
    pub fn new(id: ChannelId, value: f64) -> Self {
        Self {
            id,
            value: clamp_unit(value),
            cumulative_delta: 0,
            last_update_ms: None,
        }
    }
}

/// Result of an application-side `set`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetOutcome {
    /// Value actually stored after clamping
    pub value: f64,
    /// Whether the stored value differs from the previous one
    pub changed: bool,
}

/// Result of applying a hardware report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardwareUpdate {
    /// Value stored (device-reported, clamped)
    pub value: f64,
    /// Value before the report
    pub previous: f64,
    /// Cumulative raw delta after the report
    pub cumulative_delta: i64,
}

/// Build the fixed-order channel array from initial values
pub fn initial_states(values: [f64; CHANNEL_COUNT]) -> [ChannelState; CHANNEL_COUNT] {
    std::array::from_fn(|i| ChannelState::new(ChannelId(i as u8), values[i]))
}

/// Clamp into the normalized range; NaN collapses to 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
