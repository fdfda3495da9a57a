//! Counting latch for in-flight part uploads
//!
//! The writer adds one per submitted buffer; the buffer's completion path
//! calls `done`. Close and abort wait in bounded rounds until it drains.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::error;

/// Counting latch supporting `add`, `done` and a bounded `wait`
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    /// Create an empty wait group
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of outstanding work
    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark one unit of work as terminated
    pub fn done(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.notify.notify_waiters(),
            Ok(_) => {}
            Err(_) => error!("WaitGroup::done called more often than add"),
        }
    }

    /// Current outstanding count
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until the count drops to zero or `timeout` elapses.
    ///
    /// Returns whether the group drained.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before reading the count so a concurrent `done` can't slip between.
            notified.as_mut().enable();

            if self.count() == 0 {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_empty_group_is_drained() {
        let wait = WaitGroup::new();
        assert!(wait.wait(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_then_drains() {
        let wait = Arc::new(WaitGroup::new());
        wait.add();
        wait.add();
        assert_eq!(wait.count(), 2);

        assert!(!wait.wait(Duration::from_millis(20)).await);

        let worker = wait.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            worker.done();
            tokio::time::sleep(Duration::from_millis(10)).await;
            worker.done();
        });

        assert!(wait.wait(Duration::from_secs(5)).await);
        assert_eq!(wait.count(), 0);
        handle.await.unwrap();
    }

    #[test]
    fn test_done_without_add_does_not_underflow() {
        let wait = WaitGroup::new();
        wait.done();
        assert_eq!(wait.count(), 0);
    }
}
