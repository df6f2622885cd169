//! Rolling error window.
//!
//! Every network error against a peer is timestamped. Errors older than the
//! window are forgotten; once the number of errors still inside the window
//! exceeds `max_errors`, the window reports a trip and the caller takes the
//! peer offline.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RecordedError {
    pub at: Instant,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ErrorWindow {
    errors: VecDeque<RecordedError>,
}

impl ErrorWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error and returns true if the window now holds more than
    /// `max_errors` entries.
    pub fn record(
        &mut self,
        now: Instant,
        window: Duration,
        max_errors: usize,
        reason: impl Into<String>,
    ) -> bool {
        self.expire(now, window);
        self.errors.push_back(RecordedError {
            at: now,
            reason: reason.into(),
        });
        self.errors.len() > max_errors
    }

    /// Number of errors still inside the window at `now`.
    pub fn count(&mut self, now: Instant, window: Duration) -> usize {
        self.expire(now, window);
        self.errors.len()
    }

    pub fn last(&self) -> Option<&RecordedError> {
        self.errors.back()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    fn expire(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.errors.front() {
            if now.saturating_duration_since(oldest.at) >= window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_trips_only_above_threshold() {
        let mut window = ErrorWindow::new();
        let now = Instant::now();

        for i in 0..5 {
            assert!(
                !window.record(now, WINDOW, 5, format!("error {}", i)),
                "error {} should not trip a threshold of 5",
                i + 1
            );
        }
        assert!(window.record(now, WINDOW, 5, "error 6"));
    }

    #[test]
    fn test_old_errors_expire() {
        let mut window = ErrorWindow::new();
        let start = Instant::now();

        for _ in 0..5 {
            window.record(start, WINDOW, 5, "early");
        }

        let later = start + WINDOW + Duration::from_millis(1);
        assert_eq!(window.count(later, WINDOW), 0);
        assert!(!window.record(later, WINDOW, 5, "late"));
        assert_eq!(window.last().map(|e| e.reason.as_str()), Some("late"));
    }
}
