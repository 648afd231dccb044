//! Cancellable Timer
//!
//! A single-shot deadline owned by a driver loop. Scheduling replaces any
//! pending deadline (trailing-edge debounce).
//!
//! ```rust
//! use std::time::Duration;
//! use vitals_stream::application::services::CancellableTimer;
//!
//! # async fn example() {
//! let mut timer = CancellableTimer::new();
//! timer.schedule(Duration::from_millis(500));
//! timer.fired().await;
//! timer.cancel();
//! assert!(!timer.is_armed());
//! # }
//! ```

use std::time::Duration;

use tokio::time::Instant;

/// Single-shot, re-armable deadline.
#[derive(Debug, Default)]
pub struct CancellableTimer {
    deadline: Option<Instant>,
}

impl CancellableTimer {
    /// Create a disarmed timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer `delay` from now, replacing any pending deadline.
    pub fn schedule(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    /// Disarm the timer.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is pending.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until the deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Resolve when the deadline passes. Never resolves while disarmed.
    ///
    /// The timer stays armed after resolving; the caller disarms it in the
    /// handler.
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let mut timer = CancellableTimer::new();
        timer.schedule(Duration::from_millis(500));

        let start = Instant::now();
        timer.fired().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_restarts_the_delay() {
        let mut timer = CancellableTimer::new();
        timer.schedule(Duration::from_millis(500));
        tokio::time::advance(Duration::from_millis(400)).await;
        timer.schedule(Duration::from_millis(500));
        assert_eq!(timer.remaining(), Some(Duration::from_millis(500)));

        let start = Instant::now();
        timer.fired().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let mut timer = CancellableTimer::new();
        timer.schedule(Duration::from_millis(10));
        timer.cancel();
        assert!(!timer.is_armed());
        assert_eq!(timer.remaining(), None);

        let fired = tokio::time::timeout(Duration::from_secs(60), timer.fired()).await;
        assert!(fired.is_err());
    }
}
