//! Loop scheduler: re-run a block a fixed interval after each run ends.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::ScheduleError;

#[derive(Debug, Default)]
struct LoopState {
    armed: bool,
    interval: Duration,
    pending: Option<JoinHandle<()>>,
    /// Bumped on every cancel; a wait that wakes up into a newer
    /// generation does nothing.
    generation: u64,
}

#[derive(Debug, Default, Clone)]
pub struct LoopScheduler {
    state: Arc<Mutex<LoopState>>,
}

impl LoopScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) with `interval`. Does not schedule anything by itself.
    pub fn arm(&self, interval: Duration) -> Result<(), ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::InvalidInterval);
        }
        let mut s = self.lock();
        s.armed = true;
        s.interval = interval;
        Ok(())
    }

    /// Cancel the pending wait. A run in flight finishes but is not followed
    /// by another.
    pub fn disarm(&self) {
        let mut s = self.lock();
        s.armed = false;
        Self::cancel_locked(&mut s);
    }

    /// Takes effect from the next wait; a wait already running keeps its
    /// original deadline.
    pub fn set_interval(&self, interval: Duration) -> Result<(), ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::InvalidInterval);
        }
        self.lock().interval = interval;
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    pub fn interval(&self) -> Duration {
        self.lock().interval
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Drop the pending wait but stay armed.
    pub fn cancel_pending(&self) {
        Self::cancel_locked(&mut self.lock());
    }

    /// Wait one interval, then call `f`, unless disarmed or cancelled
    /// meanwhile. Replaces any wait already pending. Returns whether a wait
    /// was scheduled.
    pub fn schedule<F, Fut>(&self, f: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut s = self.lock();
        if !s.armed {
            return false;
        }
        Self::cancel_locked(&mut s);

        let generation = s.generation;
        let interval = s.interval;
        let state = self.state.clone();

        s.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            {
                let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
                if !s.armed || s.generation != generation {
                    return;
                }
                // From here on a cancel must not abort the run itself.
                s.pending = None;
            }
            tracing::debug!(?interval, "loop interval elapsed");
            f().await;
        }));
        true
    }

    fn cancel_locked(s: &mut LoopState) {
        s.generation = s.generation.wrapping_add(1);
        if let Some(pending) = s.pending.take() {
            pending.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for LoopState {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}
