//! Encoder Bridge
//!
//! Serial bridge for a four-channel rotary-encoder controller: decodes the
//! device's `ENC:` status lines into normalized parameter state, publishes
//! parameter events, and drives the device's LED rings with rate-limited
//! feedback. Unexpected disconnects are recovered automatically.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod led_throttle;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod transport;

pub use bridge::{BridgeStatus, EncoderBridge};
pub use bus::{ApplicationCommand, BridgeEvent, EventBus, EventSink};
pub use config::BridgeConfig;
pub use error::{ConnectionError, DecodeError, WriteError};
