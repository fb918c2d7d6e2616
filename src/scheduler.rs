//! Scheduler - injectable clock and single-shot delayed tasks
//!
//! The LED flush timer, the init pacing and the reconnect backoff all go
//! through this trait so tests can drive time. [`TokioScheduler`] runs on
//! `tokio::time`, which means a test runtime started with `start_paused = true`
//! advances deterministically.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A unit of deferred work
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Clock and timer source
pub trait Scheduler: Send + Sync {
    /// Monotonic time, used for throttle windows
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, used in published events
    fn timestamp_ms(&self) -> i64;

    /// Run `task` once after `delay`
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Future that completes after `delay`
    fn sleep(&self, delay: Duration) -> Task;
}

/// Handle to a scheduled task
///
/// Cancelling only prevents the task from starting; once the delay has
/// elapsed the task runs to completion.
#[derive(Debug)]
pub struct TimerHandle {
    join: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Cancel the task if it has not fired yet. Returns true if it was cancelled.
    pub fn cancel(&self) -> bool {
        if self.fired.load(Ordering::SeqCst) {
            return false;
        }
        self.join.abort();
        true
    }

    /// Whether the delay has elapsed and the task started
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Scheduler backed by the tokio runtime
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> Arc<dyn Scheduler> {
        Arc::new(Self)
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn timestamp_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = Arc::clone(&fired);

        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fired_flag.store(true, Ordering::SeqCst);
            task.await;
        });

        TimerHandle { join, fired }
    }

    fn sleep(&self, delay: Duration) -> Task {
        Box::pin(tokio::time::sleep(delay))
    }
}
