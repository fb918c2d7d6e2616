//! Protocol codec - wire format translation
//!
//! Inbound lines are parsed into [`ChannelDelta`] values. Outbound commands are
//! script statements for the device's own interpreter; the bridge only
//! generates and transmits them, it never evaluates them.

use crate::error::DecodeError;
use crate::state::{ChannelId, CHANNEL_COUNT};

/// Line ending for every command sent to the device
pub const LINE_ENDING: &str = "\r\n";

/// Prefix of encoder status lines
const ENCODER_PREFIX: &str = "ENC:";

/// Acknowledgment line printed by the device at the end of initialization
const READY_ACK: &str = "READY";

/// One decoded encoder report from the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelDelta {
    /// Channel the encoder belongs to (0-based)
    pub channel: ChannelId,
    /// Raw detent count since the previous report (signed)
    pub raw_delta: i32,
    /// Device-side accumulated position (0.0-1.0)
    pub value: f64,
}

/// Parameters baked into the device-side script
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceScript {
    /// Number of indicator LEDs in each channel's arc
    pub leds_per_channel: u8,
    /// Normalized change per encoder detent
    pub encoder_step: f64,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            leds_per_channel: 12,
            encoder_step: 0.01,
        }
    }
}

/// Parse a line, reporting why it does not decode
///
/// Accepts exactly `ENC:<digits>:<-?digits>:<digits[.digits]>`.
pub fn parse_line(line: &str) -> Result<ChannelDelta, DecodeError> {
    let body = line
        .trim_end()
        .strip_prefix(ENCODER_PREFIX)
        .ok_or(DecodeError::Malformed)?;

    let mut fields = body.split(':');
    let (Some(channel), Some(delta), Some(value), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(DecodeError::Malformed);
    };

    if !is_unsigned_integer(channel) || !is_signed_integer(delta) || !is_decimal(value) {
        return Err(DecodeError::Malformed);
    }

    let channel_1based: u32 = channel.parse().map_err(|_| DecodeError::Malformed)?;
    let raw_delta: i32 = delta.parse().map_err(|_| DecodeError::Malformed)?;
    let value: f64 = value.parse().map_err(|_| DecodeError::Malformed)?;

    let channel = channel_1based
        .checked_sub(1)
        .and_then(|idx| u8::try_from(idx).ok())
        .and_then(ChannelId::new)
        .ok_or(DecodeError::UnsupportedChannel(channel_1based))?;

    Ok(ChannelDelta {
        channel,
        raw_delta,
        value,
    })
}

/// Decode a line into a channel delta, or nothing
///
/// Malformed lines and channels outside 1-4 are expected on a noisy link and
/// are dropped silently.
pub fn decode(line: &str) -> Option<ChannelDelta> {
    match parse_line(line) {
        Ok(delta) => Some(delta),
        Err(reason) => {
            tracing::trace!(line, %reason, "Ignoring device line");
            None
        }
    }
}

/// Whether the line is the device's end-of-initialization acknowledgment
pub fn is_ready_ack(line: &str) -> bool {
    line.trim() == READY_ACK
}

/// Build the ordered device setup sequence
///
/// Order matters: the device must be reset before the rendering function is
/// installed, and both functions must exist before values are seeded and drawn.
/// The caller paces these commands; the device parser overruns otherwise.
pub fn encode_init(script: &DeviceScript, initial_values: &[f64; CHANNEL_COUNT]) -> Vec<String> {
    let seeded = initial_values
        .iter()
        .map(|v| format_value(*v))
        .collect::<Vec<_>>()
        .join(",");

    vec![
        command("reset();"),
        command(&format!(
            "var LEDS={leds};var vals=[0,0,0,0];\
             function render(c){{var n=Math.round(E.clamp(vals[c],0,1)*LEDS);\
             for(var i=0;i<LEDS;i++)RING[c][i].write(i<n);}}",
            leds = script.leds_per_channel
        )),
        command(&format!(
            "function onDelta(c,d){{vals[c]=E.clamp(vals[c]+d*{step},0,1);\
             print(\"ENC:\"+(c+1)+\":\"+d+\":\"+vals[c].toFixed(3));render(c);}}",
            step = script.encoder_step
        )),
        command(&format!("vals=[{seeded}];")),
        command(&format!("for(var c=0;c<{CHANNEL_COUNT};c++)render(c);")),
        command(&format!("print(\"{READY_ACK}\");")),
    ]
}

/// Build the command that sets one channel's value and redraws its indicator
pub fn encode_led_update(channel: ChannelId, value: f64) -> String {
    let idx = channel.index();
    command(&format!("vals[{idx}]={};render({idx});", format_value(value)))
}

fn command(body: &str) -> String {
    format!("{body}{LINE_ENDING}")
}

fn format_value(value: f64) -> String {
    format!("{:.3}", value.clamp(0.0, 1.0))
}

fn is_unsigned_integer(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_signed_integer(s: &str) -> bool {
    is_unsigned_integer(s.strip_prefix('-').unwrap_or(s))
}

fn is_decimal(s: &str) -> bool {
    let (int, frac) = match s.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (s, None),
    };
    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    let has_digit = !int.is_empty() || frac.is_some_and(|f| !f.is_empty());
    has_digit && digits(int) && frac.map_or(true, digits)
}
