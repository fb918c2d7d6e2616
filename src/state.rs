//! Parameter state - canonical normalized values for the four encoder channels
//!
//! The store is an actor: one task owns the channel array and applies
//! hardware reports and application writes strictly one at a time.

mod actor;
mod actor_handle;
mod commands;
mod types;

pub use actor::ParameterStoreActor;
pub use actor_handle::ParameterStoreHandle;
pub use types::{
    clamp_unit, ChannelId, ChannelState, HardwareUpdate, SetOutcome, CHANNEL_COUNT,
    CHANNEL_NAMES, DEFAULT_CHANNEL_VALUE,
};
