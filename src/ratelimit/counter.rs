//! Fixed-window rate limit counter.
//!
//! A counter holds the start of its current window and the number of
//! requests admitted since then. Once a full window has elapsed the next
//! request starts a fresh window. Because windows are fixed rather than
//! sliding, a caller can get up to twice the limit through in a short burst
//! that straddles a window boundary.

/// Outcome of a single acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// The request fits in the current window; the count was incremented.
    Allowed,
    /// The window is full; the count is unchanged.
    Denied {
        /// Seconds until the window rolls over, never less than 1
        retry_after_seconds: u64,
    },
}

impl AcquireResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AcquireResult::Allowed)
    }
}

/// Request count for one caller on one endpoint.
///
/// Not synchronized on its own: the counter store wraps each instance in a
/// mutex so that check-and-increment is atomic per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCounter {
    /// When the current window started (epoch millis)
    window_start_millis: u64,
    /// Requests admitted in the current window
    count: u64,
}

impl WindowCounter {
    /// Create a counter whose first window starts at `now_millis`.
    pub fn new(now_millis: u64) -> Self {
        Self {
            window_start_millis: now_millis,
            count: 0,
        }
    }

    /// Admit one request if the current window has room for it.
    pub fn try_acquire(
        &mut self,
        now_millis: u64,
        limit: u64,
        window_seconds: u64,
    ) -> AcquireResult {
        self.roll_window(now_millis, window_seconds);

        if self.count >= limit {
            let elapsed_secs = now_millis.saturating_sub(self.window_start_millis) / 1000;
            let retry_after_seconds = window_seconds.saturating_sub(elapsed_secs).max(1);
            return AcquireResult::Denied { retry_after_seconds };
        }

        self.count += 1;
        AcquireResult::Allowed
    }

    /// Requests admitted in the window that is current at `now_millis`.
    pub fn current_count(&self, now_millis: u64, window_seconds: u64) -> u64 {
        if self.window_expired(now_millis, window_seconds) {
            0
        } else {
            self.count
        }
    }

    pub fn window_start_millis(&self) -> u64 {
        self.window_start_millis
    }

    fn roll_window(&mut self, now_millis: u64, window_seconds: u64) {
        if self.window_expired(now_millis, window_seconds) {
            self.window_start_millis = now_millis;
            self.count = 0;
        }
    }

    // A clock that steps backwards counts as no time elapsed.
    fn window_expired(&self, now_millis: u64, window_seconds: u64) -> bool {
        now_millis.saturating_sub(self.window_start_millis) >= window_seconds.saturating_mul(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_allows_up_to_limit() {
        let mut counter = WindowCounter::new(0);

        for _ in 0..5 {
            assert_eq!(counter.try_acquire(100, 5, 60), AcquireResult::Allowed);
        }
        assert_eq!(counter.current_count(100, 60), 5);

        // The 6th request should be rejected
        assert!(!counter.try_acquire(100, 5, 60).is_allowed());
        assert_eq!(counter.current_count(100, 60), 5);
    }

    #[test]
    fn test_retry_after_counts_down() {
        let mut counter = WindowCounter::new(0);
        assert!(counter.try_acquire(0, 1, 60).is_allowed());

        assert_eq!(
            counter.try_acquire(0, 1, 60),
            AcquireResult::Denied { retry_after_seconds: 60 }
        );
        assert_eq!(
            counter.try_acquire(15_500, 1, 60),
            AcquireResult::Denied { retry_after_seconds: 45 }
        );
        // Never reports zero even in the last partial second
        assert_eq!(
            counter.try_acquire(59_999, 1, 60),
            AcquireResult::Denied { retry_after_seconds: 1 }
        );
    }

    #[test]
    fn test_window_rollover_resets_count() {
        let mut counter = WindowCounter::new(1_000);
        for _ in 0..3 {
            assert!(counter.try_acquire(1_000, 3, 10).is_allowed());
        }
        assert!(!counter.try_acquire(10_999, 3, 10).is_allowed());

        // Exactly one window later
        assert!(counter.try_acquire(11_000, 3, 10).is_allowed());
        assert_eq!(counter.window_start_millis(), 11_000);
        assert_eq!(counter.current_count(11_000, 10), 1);
    }

    #[test]
    fn test_boundary_burst_is_preserved() {
        let mut counter = WindowCounter::new(0);
        let mut admitted = 0;

        // Fill the tail of the first window, then the head of the next one
        for _ in 0..4 {
            if counter.try_acquire(9_900, 4, 10).is_allowed() {
                admitted += 1;
            }
        }
        for _ in 0..4 {
            if counter.try_acquire(10_100, 4, 10).is_allowed() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 8);
    }

    #[test]
    fn test_clock_going_backwards_keeps_window() {
        let mut counter = WindowCounter::new(5_000);
        assert!(counter.try_acquire(5_000, 1, 1).is_allowed());
        assert_eq!(
            counter.try_acquire(4_000, 1, 1),
            AcquireResult::Denied { retry_after_seconds: 1 }
        );
        assert_eq!(counter.window_start_millis(), 5_000);
    }

    #[test]
    fn test_current_count_after_expiry_is_zero() {
        let mut counter = WindowCounter::new(0);
        counter.try_acquire(0, 10, 1);
        assert_eq!(counter.current_count(999, 1), 1);
        assert_eq!(counter.current_count(1_000, 1), 0);
    }
}
