//! Device wire protocol
//!
//! Line framing for the inbound byte stream and the textual codec for both
//! directions. The device speaks newline-terminated ASCII at 115200 baud:
//!
//! ```text
//! device -> bridge   ENC:<channel 1-4>:<signed delta>:<value 0.000-1.000>\n
//! bridge -> device   <script command>\r\n
//! ```

pub mod codec;
pub mod framer;

pub use codec::{
    decode, encode_init, encode_led_update, is_ready_ack, parse_line, ChannelDelta,
    DeviceScript, LINE_ENDING,
};
pub use framer::LineFramer;
