//! Generation-counted timer slots
//!
//! Every timer a component owns (auth timeout, silence timer, barge-in
//! confirmation, reconnect delay) lives in exactly one `TimerSlot`. Arming
//! the slot cancels the previous timer; firing delivers the generation that
//! armed it, so a handler can discard a stale expiry with a single compare.

use std::time::Duration;
use tokio::task::JoinHandle;

/// A single-occupancy timer handle with a generation counter.
///
/// The slot never fires a callback for a timer that has been superseded by
/// `arm` or released by `cancel`: cancellation aborts the sleeping task, and
/// the generation check catches the race where the task already woke.
#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot, cancelling any previously armed timer.
    ///
    /// `on_fire` runs on the timer task after `duration` elapses and
    /// receives the generation returned here. Handlers must treat a
    /// generation that no longer matches [`TimerSlot::generation`] as a
    /// no-op.
    pub fn arm<F>(&mut self, duration: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_fire(generation);
        }));
        generation
    }

    /// Cancel the armed timer, if any. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Generation of the most recently armed timer
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a fired generation is still the current one
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.handle.is_some()
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_with_generation() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut slot = TimerSlot::new();

        let fired_clone = fired.clone();
        let gen = slot.arm(Duration::from_millis(100), move |g| {
            fired_clone.store(g, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), gen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut slot = TimerSlot::new();

        let fired_clone = fired.clone();
        slot.arm(Duration::from_millis(100), move |g| {
            fired_clone.store(g, Ordering::SeqCst);
        });
        slot.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_supersedes() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut slot = TimerSlot::new();

        let first = fired.clone();
        let stale_gen = slot.arm(Duration::from_millis(100), move |g| {
            first.store(g, Ordering::SeqCst);
        });

        // Re-arm before the first expires; only the second may fire.
        let second = fired.clone();
        let live_gen = slot.arm(Duration::from_millis(100), move |g| {
            second.store(g, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_ne!(stale_gen, live_gen);
        assert_eq!(fired.load(Ordering::SeqCst), live_gen);
    }
}
