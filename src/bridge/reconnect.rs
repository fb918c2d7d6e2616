//! ReconnectSupervisor - at most one pending reconnect attempt
//!
//! The supervisor only keeps the bookkeeping: the pending timer, the attempt
//! it stands for and the user suppression flag. What an attempt does is up to
//! the bridge, which hands in the task to run.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::scheduler::{Scheduler, Task, TimerHandle};

/// Who asked for the attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOrigin {
    Automatic,
    User,
}

/// A scheduled reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAttempt {
    pub scheduled_at: Instant,
    pub origin: ReconnectOrigin,
}

#[derive(Default)]
struct SupervisorState {
    suppressed: bool,
    pending: Option<(ReconnectAttempt, TimerHandle)>,
    scheduled_total: u64,
}

pub struct ReconnectSupervisor {
    enabled: bool,
    delay: Duration,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<SupervisorState>,
}

impl ReconnectSupervisor {
    pub fn new(enabled: bool, delay: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            enabled,
            delay,
            scheduler,
            state: Mutex::new(SupervisorState::default()),
        }
    }

    /// Arm the reconnect timer
    ///
    /// Returns false (and drops `task`) when reconnects are disabled, the user
    /// suppressed them, or an attempt is already pending.
    pub fn schedule(&self, task: Task) -> bool {
        if !self.enabled {
            debug!("Automatic reconnect disabled");
            return false;
        }

        let mut state = self.state.lock();
        if state.suppressed {
            debug!("Reconnect suppressed by user disconnect");
            return false;
        }
        if state.pending.is_some() {
            debug!("Reconnect already pending");
            return false;
        }

        let attempt = ReconnectAttempt {
            scheduled_at: self.scheduler.now() + self.delay,
            origin: ReconnectOrigin::Automatic,
        };
        let timer = self.scheduler.schedule(self.delay, task);
        state.pending = Some((attempt, timer));
        state.scheduled_total += 1;

        info!(delay_ms = self.delay.as_millis() as u64, "Reconnect scheduled");
        true
    }

    /// Called by the attempt itself when its timer fires
    ///
    /// Returns the attempt, or `None` if it was cancelled in the meantime.
    pub fn begin_attempt(&self) -> Option<ReconnectAttempt> {
        let mut state = self.state.lock();
        let (attempt, _timer) = state.pending.take()?;
        if state.suppressed {
            return None;
        }
        Some(attempt)
    }

    /// User-initiated disconnect: cancel anything pending and stay down
    pub fn suppress(&self) {
        let mut state = self.state.lock();
        state.suppressed = true;
        if let Some((_, timer)) = state.pending.take() {
            timer.cancel();
            debug!("Pending reconnect cancelled");
        }
    }

    /// User-initiated connect: automatic reconnects are allowed again
    pub fn clear_suppression(&self) {
        let mut state = self.state.lock();
        state.suppressed = false;
        if let Some((_, timer)) = state.pending.take() {
            timer.cancel();
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.state.lock().suppressed
    }

    pub fn pending(&self) -> Option<ReconnectAttempt> {
        self.state.lock().pending.as_ref().map(|(attempt, _)| *attempt)
    }

    /// Timers armed since startup
    pub fn scheduled_total(&self) -> u64 {
        self.state.lock().scheduled_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn supervisor() -> Arc<ReconnectSupervisor> {
        Arc::new(ReconnectSupervisor::new(
            true,
            Duration::from_millis(3000),
            TokioScheduler::shared(),
        ))
    }

    fn counting_task(supervisor: &Arc<ReconnectSupervisor>, hits: &Arc<AtomicUsize>) -> Task {
        let supervisor = supervisor.clone();
        let hits = hits.clone();
        Box::pin(async move {
            if supervisor.begin_attempt().is_some() {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_attempt_pending() {
        let sup = supervisor();
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(sup.schedule(counting_task(&sup, &hits)));
        assert!(!sup.schedule(counting_task(&sup, &hits)));
        assert_eq!(sup.pending().unwrap().origin, ReconnectOrigin::Automatic);

        tokio::time::sleep(Duration::from_millis(3001)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(sup.pending().is_none());
        assert_eq!(sup.scheduled_total(), 1);

        // Once fired, a new disconnect may schedule again
        assert!(sup.schedule(counting_task(&sup, &hits)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppress_cancels_and_blocks() {
        let sup = supervisor();
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(sup.schedule(counting_task(&sup, &hits)));
        sup.suppress();
        assert!(sup.pending().is_none());
        assert!(!sup.schedule(counting_task(&sup, &hits)));

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        sup.clear_suppression();
        assert!(sup.schedule(counting_task(&sup, &hits)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_schedules() {
        let sup = ReconnectSupervisor::new(false, Duration::from_millis(3000), TokioScheduler::shared());
        assert!(!sup.schedule(Box::pin(async {})));
        assert!(sup.pending().is_none());
    }
}
