//! LED throttler - coalesced, rate-limited indicator feedback
//!
//! The serial link is slow and the device parser is easily flooded, so each
//! channel gets at most one LED command per throttle window:
//!
//! 1. A request on a channel whose window has closed is sent immediately.
//! 2. A request inside the window becomes the channel's pending value,
//!    replacing any earlier pending value (last-write-wins, no queue).
//! 3. A single trailing flush timer sends each pending value once its window
//!    closes, then re-arms while anything is still pending.
//!
//! Requests that differ from the last sent value by less than `min_delta` are
//! dropped; the indicator already shows that position.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::scheduler::{Scheduler, TimerHandle};
use crate::state::{ChannelId, CHANNEL_COUNT};

/// Minimum spacing between two LED commands on the same channel
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 50;

/// Changes smaller than this (from the last sent value) are not sent
pub const DEFAULT_MIN_DELTA: f64 = 0.02;

/// Destination for LED commands
///
/// Implemented by the bridge on top of the codec and the serial transport.
/// Returns whether the command reached the device.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn send_led(&self, channel: ChannelId, value: f64) -> bool;
}

/// Throttle parameters
#[derive(Debug, Clone, Copy)]
pub struct ThrottleSettings {
    pub interval: Duration,
    pub min_delta: f64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS),
            min_delta: DEFAULT_MIN_DELTA,
        }
    }
}

/// What `request` did with a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Sent right away
    Sent,
    /// Stored as the channel's pending value for the trailing flush
    Deferred,
    /// Too close to the last sent value
    Suppressed,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    pub sent: u64,
    pub coalesced: u64,
    pub suppressed: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChannelSlot {
    last_sent_at: Option<Instant>,
    last_sent_value: Option<f64>,
    pending: Option<f64>,
}

#[derive(Default)]
struct ThrottleState {
    slots: [ChannelSlot; CHANNEL_COUNT],
    flush_timer: Option<TimerHandle>,
    flush_deadline: Option<Instant>,
    stats: ThrottleStats,
}

struct Inner {
    settings: ThrottleSettings,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn FeedbackSink>,
    state: Mutex<ThrottleState>,
}

/// Per-channel rate limiter for LED feedback
#[derive(Clone)]
pub struct LedThrottler {
    inner: Arc<Inner>,
}

impl LedThrottler {
    pub fn new(
        settings: ThrottleSettings,
        scheduler: Arc<dyn Scheduler>,
        sink: Arc<dyn FeedbackSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                scheduler,
                sink,
                state: Mutex::new(ThrottleState::default()),
            }),
        }
    }

    /// Request that a channel's indicator show `value`
    pub async fn request(&self, channel: ChannelId, value: f64) -> ThrottleDecision {
        let decision = self.inner.decide(channel, value);

        if decision == ThrottleDecision::Sent {
            self.inner.deliver(channel, value).await;
        }

        decision
    }

    /// Forget all send history and pending values
    ///
    /// Called after the init sequence has seeded the device: `seeded` becomes
    /// the new baseline for the magnitude threshold.
    pub fn reset(&self, seeded: Option<[f64; CHANNEL_COUNT]>) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.flush_timer.take() {
            timer.cancel();
        }
        state.flush_deadline = None;
        for (idx, slot) in state.slots.iter_mut().enumerate() {
            *slot = ChannelSlot {
                last_sent_value: seeded.map(|values| values[idx]),
                ..ChannelSlot::default()
            };
        }
        debug!("LED throttle state reset");
    }

    /// Whether a channel has a value waiting for the trailing flush
    pub fn has_pending(&self, channel: ChannelId) -> bool {
        self.inner.state.lock().slots[channel.index()].pending.is_some()
    }

    /// Whether the trailing flush timer is armed
    pub fn flush_armed(&self) -> bool {
        self.inner.state.lock().flush_deadline.is_some()
    }

    pub fn stats(&self) -> ThrottleStats {
        self.inner.state.lock().stats
    }
}

impl Inner {
    fn decide(self: &Arc<Self>, channel: ChannelId, value: f64) -> ThrottleDecision {
        let now = self.scheduler.now();
        let interval = self.settings.interval;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let slot = &mut state.slots[channel.index()];

        if let Some(last) = slot.last_sent_value {
            if (value - last).abs() < self.settings.min_delta {
                // The device already shows (nearly) this value; anything
                // pending is older and must not overwrite it.
                slot.pending = None;
                state.stats.suppressed += 1;
                trace!(%channel, value, last, "LED update below threshold");
                return ThrottleDecision::Suppressed;
            }
        }

        let window_closed = slot
            .last_sent_at
            .map_or(true, |at| now.duration_since(at) >= interval);

        if window_closed {
            slot.last_sent_at = Some(now);
            slot.last_sent_value = Some(value);
            slot.pending = None;
            state.stats.sent += 1;
            return ThrottleDecision::Sent;
        }

        let eligible_at = slot.last_sent_at.map_or(now, |at| at + interval);
        if slot.pending.replace(value).is_some() {
            state.stats.coalesced += 1;
        }

        trace!(%channel, value, "LED update deferred");
        self.arm_flush(state, eligible_at, now);

        ThrottleDecision::Deferred
    }

    /// Make sure exactly one flush timer is armed, no later than `at`
    fn arm_flush(self: &Arc<Self>, state: &mut ThrottleState, at: Instant, now: Instant) {
        if let Some(deadline) = state.flush_deadline {
            if deadline <= at {
                return;
            }
            // An earlier window closes first; move the timer forward if it
            // has not started running yet.
            if let Some(timer) = &state.flush_timer {
                if !timer.cancel() {
                    return;
                }
            }
        }

        let weak: Weak<Inner> = Arc::downgrade(self);
        let delay = at.saturating_duration_since(now);
        let timer = self.scheduler.schedule(
            delay,
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.flush().await;
                }
            }),
        );

        state.flush_timer = Some(timer);
        state.flush_deadline = Some(at);
    }

    async fn flush(self: Arc<Self>) {
        let due = {
            let now = self.scheduler.now();
            let interval = self.settings.interval;
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.flush_timer = None;
            state.flush_deadline = None;

            let mut due = Vec::new();
            let mut next_deadline: Option<Instant> = None;

            for (idx, slot) in state.slots.iter_mut().enumerate() {
                let Some(value) = slot.pending else {
                    continue;
                };
                let eligible_at = slot.last_sent_at.map_or(now, |at| at + interval);
                if eligible_at <= now {
                    slot.pending = None;
                    slot.last_sent_at = Some(now);
                    slot.last_sent_value = Some(value);
                    due.push((idx, value));
                } else {
                    next_deadline = Some(next_deadline.map_or(eligible_at, |d| d.min(eligible_at)));
                }
            }

            state.stats.sent += due.len() as u64;

            if let Some(at) = next_deadline {
                self.arm_flush(state, at, now);
            }

            due
        };

        for (idx, value) in due {
            if let Some(channel) = ChannelId::new(idx as u8) {
                trace!(%channel, value, "Flushing coalesced LED update");
                self.deliver(channel, value).await;
            }
        }
    }

    async fn deliver(&self, channel: ChannelId, value: f64) {
        if !self.sink.send_led(channel, value).await {
            // Nothing reached the device; do not let a stale baseline
            // suppress the next request.
            let mut state = self.state.lock();
            state.slots[channel.index()].last_sent_value = None;
        }
    }
}
