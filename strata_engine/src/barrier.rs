//! Pause barrier for transport upgrades.

use tokio::sync::watch;

/// A gate that lets a session suspend all of its I/O workers atomically
/// while a transport swap is in flight.
///
/// [`wait`](Barrier::wait) blocks only between a [`pause`](Barrier::pause)
/// and the matching [`resume`](Barrier::resume); before any pause it returns
/// immediately. Nesting is not supported.
#[derive(Debug, Clone)]
pub struct Barrier {
    paused: watch::Sender<bool>,
}

impl Barrier {
    /// A new, unpaused barrier.
    #[must_use]
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    /// Gate subsequent [`wait`](Barrier::wait) calls.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    /// Release waiting callers.
    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    /// Whether the barrier is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Block while the barrier is paused.
    pub async fn wait(&self) {
        let mut rx = self.paused.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_before_pause_is_a_no_op() {
        let barrier = Barrier::new();
        barrier.wait().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_resume() {
        let barrier = Barrier::new();
        barrier.pause();

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "wait must block while paused");

        barrier.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait released")
            .expect("waiter task");
    }

    #[tokio::test]
    async fn resume_is_level_triggered() {
        let barrier = Barrier::new();
        barrier.pause();
        barrier.resume();
        // A waiter arriving after the resume must not block.
        barrier.wait().await;
    }
}
