//! Owned one-shot timers
//!
//! Every pending timeout in the engine (ring-no-answer, reconnection
//! window, max call duration) is a [`ScheduledTask`]. Whoever holds the task
//! owns the timeout; cancelling after it fired, or twice, is a no-op.
//! Dropping a pending task cancels it.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug)]
pub struct ScheduledTask {
    state: Arc<AtomicU8>,
    deadline: Instant,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `action` after `delay` unless cancelled first.
    /// Must be called from within a tokio runtime.
    pub fn start<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let deadline = Instant::now() + delay;
        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if task_state
                .compare_exchange(PENDING, FIRED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                action.await;
            }
        });
        Self { state, deadline, handle }
    }

    /// Cancel the timer. Returns true only if it had not fired yet.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if cancelled {
            self.handle.abort();
        }
        cancelled
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::SeqCst) == PENDING
    }

    /// Time left before firing; zero once due
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
