//! ParameterStoreActor - single owner of channel state
//!
//! All mutations, hardware-originated and application-originated, are funneled
//! through this actor's command channel and applied one at a time:
//! - no lock is shared between the read loop and application callers
//! - readers never observe a half-applied update
//! - every stored value is clamped to 0.0-1.0

use super::actor_handle::ParameterStoreHandle;
use super::commands::StoreCommand;
use super::types::{
    clamp_unit, initial_states, ChannelId, ChannelState, HardwareUpdate, SetOutcome,
    CHANNEL_COUNT,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Actor owning the canonical parameter state
///
/// ```text
/// read loop ──ApplyHardwareDelta──┐
///                                 ▼
///                     ┌───────────────────────┐
/// app commands ──Set──►  command_rx (mpsc)    │
///                     │  channels: [State; 4] │
/// queries ──Get/Snapshot──►                   │
///                     └───────────────────────┘
/// ```
pub struct ParameterStoreActor {
    channels: [ChannelState; CHANNEL_COUNT],
    command_rx: mpsc::UnboundedReceiver<StoreCommand>,
    /// Total mutations applied (reported on shutdown)
    update_count: u64,
}

impl ParameterStoreActor {
    /// Spawn the actor with initial channel values and return its handle
    pub fn spawn(initial_values: [f64; CHANNEL_COUNT]) -> ParameterStoreHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let actor = ParameterStoreActor {
            channels: initial_states(initial_values),
            command_rx: cmd_rx,
            update_count: 0,
        };

        tokio::spawn(actor.run());

        info!("Parameter store spawned");

        ParameterStoreHandle::new(cmd_tx)
    }

    async fn run(mut self) {
        debug!("Parameter store run loop started");

        while let Some(cmd) = self.command_rx.recv().await {
            trace!(?cmd, "Processing store command");

            match cmd {
                StoreCommand::Get { channel, response } => {
                    let _ = response.send(self.channels[channel.index()].value);
                }
                StoreCommand::Set {
                    channel,
                    value,
                    ts,
                    response,
                } => {
                    let outcome = self.handle_set(channel, value, ts);
                    let _ = response.send(outcome);
                }
                StoreCommand::ApplyHardwareDelta {
                    channel,
                    raw_delta,
                    reported_value,
                    ts,
                    response,
                } => {
                    let update = self.handle_hardware_delta(channel, raw_delta, reported_value, ts);
                    let _ = response.send(update);
                }
                StoreCommand::Values { response } => {
                    let _ = response.send(self.values());
                }
                StoreCommand::Snapshot { response } => {
                    let _ = response.send(self.channels.to_vec());
                }
                StoreCommand::Shutdown => {
                    info!("Parameter store received shutdown command");
                    break;
                }
            }
        }

        info!(
            update_count = self.update_count,
            "Parameter store run loop terminated"
        );
    }

    fn handle_set(&mut self, channel: ChannelId, value: f64, ts: i64) -> SetOutcome {
        let state = &mut self.channels[channel.index()];
        let clamped = clamp_unit(value);
        let changed = state.value != clamped;

        if changed {
            state.value = clamped;
            state.last_update_ms = Some(ts);
            self.update_count += 1;
        }

        trace!(%channel, requested = value, stored = clamped, changed, "Set");

        SetOutcome {
            value: clamped,
            changed,
        }
    }

    fn handle_hardware_delta(
        &mut self,
        channel: ChannelId,
        raw_delta: i32,
        reported_value: f64,
        ts: i64,
    ) -> HardwareUpdate {
        let state = &mut self.channels[channel.index()];
        let previous = state.value;

        state.value = clamp_unit(reported_value);
        state.cumulative_delta += i64::from(raw_delta);
        state.last_update_ms = Some(ts);
        self.update_count += 1;

        trace!(
            %channel,
            raw_delta,
            value = state.value,
            cumulative = state.cumulative_delta,
            "Hardware delta applied"
        );

        HardwareUpdate {
            value: state.value,
            previous,
            cumulative_delta: state.cumulative_delta,
        }
    }

    fn values(&self) -> [f64; CHANNEL_COUNT] {
        let mut out = [0.0; CHANNEL_COUNT];
        for (slot, state) in out.iter_mut().zip(&self.channels) {
            *slot = state.value;
        }
        out
    }
}
