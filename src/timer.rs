//! Timer service abstraction (spec §1 external collaborators, §4.2/§4.3 registration
//! and subscription expiry, §4.5 AS liveness timers). The core never calls
//! `tokio::time::sleep` directly from business logic — it schedules named, cancellable
//! callbacks through this trait so tests can fire them deterministically instead of
//! racing real wall-clock time.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Schedules work to run after a delay, and allows it to be cancelled before it fires.
/// Grounded on the teacher's `Facilitator`-style trait shape (§9 design notes: "global
/// services passed as explicit constructor dependencies").
pub trait TimerService: Send + Sync + 'static {
    fn schedule(
        &self,
        after: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> impl Future<Output = TimerId> + Send;

    fn cancel(&self, id: TimerId) -> impl Future<Output = ()> + Send;
}

/// `tokio::time`-backed implementation, used both in production and in tests run under
/// `tokio::time::pause()` for deterministic advancement.
pub struct TokioTimerService {
    next_id: std::sync::atomic::AtomicU64,
    handles: dashmap::DashMap<TimerId, tokio::task::JoinHandle<()>>,
}

impl TokioTimerService {
    pub fn new() -> Self {
        TokioTimerService {
            next_id: std::sync::atomic::AtomicU64::new(1),
            handles: dashmap::DashMap::new(),
        }
    }
}

impl Default for TokioTimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimerService> TimerService for std::sync::Arc<T> {
    fn schedule(
        &self,
        after: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> impl Future<Output = TimerId> + Send {
        (**self).schedule(after, callback)
    }

    fn cancel(&self, id: TimerId) -> impl Future<Output = ()> + Send {
        (**self).cancel(id)
    }
}

impl TimerService for TokioTimerService {
    async fn schedule(&self, after: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            callback();
        });
        self.handles.insert(id, handle);
        id
    }

    async fn cancel(&self, id: TimerId) {
        if let Some((_, handle)) = self.handles.remove(&id) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn scheduled_callback_fires_after_delay() {
        let timers = TokioTimerService::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        timers
            .schedule(
                Duration::from_secs(5),
                Box::new(move || flag.store(true, Ordering::SeqCst)),
            )
            .await;
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_callback_never_fires() {
        let timers = TokioTimerService::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let id = timers
            .schedule(
                Duration::from_secs(5),
                Box::new(move || flag.store(true, Ordering::SeqCst)),
            )
            .await;
        timers.cancel(id).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
