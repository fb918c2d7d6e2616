//! Hardware read path: bytes -> lines -> deltas -> store -> events

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Weak;
use tracing::{debug, info};

use super::{BridgeInner, DisconnectCause};
use crate::protocol::{decode, is_ready_ack, LineFramer};
use crate::transport::{LinkClosed, LinkHandler};

/// Link handler for one connection
///
/// A fresh reader (and framer) is created per connection, so a partial line
/// from a dead link never prefixes the first line of the next one.
pub(super) struct HardwareReader {
    bridge: Weak<BridgeInner>,
    framer: Mutex<LineFramer>,
}

impl HardwareReader {
    pub(super) fn new(bridge: Weak<BridgeInner>) -> Self {
        Self {
            bridge,
            framer: Mutex::new(LineFramer::new()),
        }
    }
}

#[async_trait]
impl LinkHandler for HardwareReader {
    async fn on_chunk(&self, chunk: &[u8]) {
        let lines = self.framer.lock().feed(chunk);
        if lines.is_empty() {
            return;
        }

        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };

        for line in lines {
            if let Some(delta) = decode(&line) {
                bridge.apply_hardware_delta(delta).await;
            } else if is_ready_ack(&line) {
                info!("Device acknowledged initialization");
            } else if !line.trim().is_empty() {
                debug!(line = %line, "Ignoring device output");
            }
        }
    }

    async fn on_closed(&self, reason: LinkClosed) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.handle_disconnect(DisconnectCause::Link(reason)).await;
        }
    }
}
