//! Cancellable one-shot timer for debounced and deferred work.
//!
//! The component that schedules delayed work owns the timer and must
//! `cancel()` or `flush()` it on teardown.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Action = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Scheduled {
    id: u64,
    cancel: CancellationToken,
    action: Arc<Mutex<Option<Action>>>,
}

#[derive(Clone, Default)]
pub struct CancellableTimer {
    slot: Arc<Mutex<Option<Scheduled>>>,
    next_id: Arc<AtomicU64>,
}

impl CancellableTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `action` after `delay`, replacing any pending action.
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut>(&self, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let action: Action = Box::new(move || action().boxed());
        let shared = Arc::new(Mutex::new(Some(action)));
        let token = CancellationToken::new();

        let previous = self.slot.lock().replace(Scheduled {
            id,
            cancel: token.clone(),
            action: Arc::clone(&shared),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let slot = Arc::clone(&self.slot);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }
            {
                let mut guard = slot.lock();
                if guard.as_ref().is_some_and(|s| s.id == id) {
                    *guard = None;
                }
            }
            let action = shared.lock().take();
            if let Some(action) = action {
                action().await;
            }
        });
    }

    /// Drops the pending action without running it. Returns whether one was
    /// pending.
    pub fn cancel(&self) -> bool {
        match self.slot.lock().take() {
            Some(scheduled) => {
                scheduled.cancel.cancel();
                scheduled.action.lock().take().is_some()
            }
            None => false,
        }
    }

    /// Runs the pending action now instead of waiting for the delay.
    pub async fn flush(&self) -> bool {
        let scheduled = self.slot.lock().take();
        let Some(scheduled) = scheduled else {
            return false;
        };
        scheduled.cancel.cancel();
        let action = scheduled.action.lock().take();
        match action {
            Some(action) => {
                action().await;
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn counter_action(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<()> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        }
    }

    #[tokio::test]
    async fn fires_once_after_delay() {
        let timer = CancellableTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        timer.start(Duration::from_millis(10), counter_action(&fired));
        assert!(timer.is_pending());

        sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test]
    async fn restart_replaces_pending_action() {
        let timer = CancellableTimer::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        timer.start(Duration::from_millis(20), counter_action(&first));
        timer.start(Duration::from_millis(20), counter_action(&second));

        sleep(Duration::from_millis(80)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let timer = CancellableTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        timer.start(Duration::from_millis(10), counter_action(&fired));

        assert!(timer.cancel());
        assert!(!timer.cancel());
        sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flush_runs_immediately_and_only_once() {
        let timer = CancellableTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        timer.start(Duration::from_secs(60), counter_action(&fired));

        assert!(timer.flush().await);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.flush().await);
        assert!(!timer.is_pending());
    }
}
