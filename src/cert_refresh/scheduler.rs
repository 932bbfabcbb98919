//! One-shot scheduled callback

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A single delayed callback. Dropping the handle cancels the callback if it
/// has not fired yet, so holding exactly one `ScheduledTask` guarantees at
/// most one pending callback.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `callback` once after `delay`. Must be called from within a tokio
    /// runtime.
    pub fn schedule<F, Fut>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback().await;
        });

        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_callback_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let task = ScheduledTask::schedule(Duration::from_millis(10), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let task = ScheduledTask::schedule(Duration::from_millis(50), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_cancels_pending_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let task = ScheduledTask::schedule(Duration::from_millis(50), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(task);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_replacing_a_task_cancels_the_previous_one() {
        let fired = Arc::new(AtomicUsize::new(0));

        let first_counter = fired.clone();
        let mut slot = Some(ScheduledTask::schedule(
            Duration::from_millis(50),
            move || async move {
                first_counter.fetch_add(1, Ordering::SeqCst);
            },
        ));

        let second_counter = fired.clone();
        let previous = slot.replace(ScheduledTask::schedule(
            Duration::from_millis(10),
            move || async move {
                second_counter.fetch_add(10, Ordering::SeqCst);
            },
        ));
        drop(previous);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        assert!(slot.take().map(|t| t.is_finished()).unwrap_or(false));
    }
}
