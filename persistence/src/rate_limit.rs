use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window limiter: at most `capacity` operations in any window.
///
/// Uses tokio's clock so paused-time tests can step through windows.
#[derive(Debug)]
pub struct SlidingWindow {
    capacity: u32,
    window: Duration,
    requests: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            requests: VecDeque::new(),
        }
    }

    /// One-second window. A capacity of zero disables limiting.
    pub fn per_second(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(1))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn cleanup(&mut self, now: Instant) {
        while let Some(&oldest) = self.requests.front() {
            if now.duration_since(oldest) >= self.window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an operation if the window has room. Returns false when the
    /// operation must be rejected.
    pub fn try_acquire(&mut self) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let now = Instant::now();
        self.cleanup(now);
        if self.requests.len() as u32 >= self.capacity {
            return false;
        }
        self.requests.push_back(now);
        true
    }

    /// Operations still accepted in the current window.
    pub fn remaining(&mut self) -> u32 {
        self.cleanup(Instant::now());
        self.capacity.saturating_sub(self.requests.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rejects_past_capacity() {
        let mut limiter = SlidingWindow::per_second(3);
        for _ in 0..3 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let mut limiter = SlidingWindow::per_second(2);
        assert!(limiter.try_acquire());
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        // First request falls out of the window; the second is still in it.
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_zero_capacity_disables_limit() {
        let mut limiter = SlidingWindow::per_second(0);
        for _ in 0..100 {
            assert!(limiter.try_acquire());
        }
    }
}
