//! Reconnection timing policy.
//!
//! A pure policy object deciding whether and when to retry a dropped
//! connection. Retries are spaced [`RETRY_SPACING`] apart inside a
//! window of at most [`MAX_RECONNECT_WINDOW`] from the first failure;
//! once the window is exhausted the disconnect becomes terminal.

use std::time::{Duration, Instant};

/// Spacing between consecutive reconnect attempts
pub const RETRY_SPACING: Duration = Duration::from_millis(3000);

/// Maximum duration of a reconnect window
pub const MAX_RECONNECT_WINDOW: Duration = Duration::from_millis(15000);

/// Decision returned by [`ReconnectStrategy::next_delay`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// No reconnect window is active
    NotReconnecting,
    /// Retry after the given delay
    Retry(Duration),
    /// The window is exhausted; state has been cleared
    Expired,
}

/// Windowed retry policy state
#[derive(Debug, Default)]
pub struct ReconnectStrategy {
    window_start: Option<Instant>,
    retry_base: Option<Instant>,
}

impl ReconnectStrategy {
    /// Create an idle strategy
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a reconnect window at `now`
    pub fn begin_window(&mut self, now: Instant) {
        self.window_start = Some(now);
        self.retry_base = Some(now);
    }

    /// Decide whether another attempt may be scheduled.
    ///
    /// Expired if and only if `now - window_start >= MAX_RECONNECT_WINDOW`;
    /// otherwise the returned delay is in `[0, RETRY_SPACING]`.
    pub fn next_delay(&mut self, now: Instant) -> RetryDecision {
        let Some(window_start) = self.window_start else {
            return RetryDecision::NotReconnecting;
        };

        if now.duration_since(window_start) >= MAX_RECONNECT_WINDOW {
            self.window_start = None;
            self.retry_base = None;
            return RetryDecision::Expired;
        }

        let base = self.retry_base.unwrap_or(window_start);
        let since_base = now.duration_since(base);
        RetryDecision::Retry(RETRY_SPACING.saturating_sub(since_base))
    }

    /// Restart the spacing clock without moving the window deadline
    pub fn mark_attempt(&mut self, now: Instant) {
        if self.window_start.is_some() {
            self.retry_base = Some(now);
        }
    }

    /// Close the window; returns whether one had been active
    pub fn end_window(&mut self) -> bool {
        let was_reconnecting = self.window_start.is_some();
        self.window_start = None;
        self.retry_base = None;
        was_reconnecting
    }

    /// Whether a reconnect window is active
    pub fn is_reconnecting(&self) -> bool {
        self.window_start.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_strategy_never_retries() {
        let mut strategy = ReconnectStrategy::new();
        assert_eq!(
            strategy.next_delay(Instant::now()),
            RetryDecision::NotReconnecting
        );
    }

    #[test]
    fn test_window_expiry_boundary() {
        let mut strategy = ReconnectStrategy::new();
        let start = Instant::now();
        strategy.begin_window(start);

        // One instant before the deadline is still a retry.
        match strategy.next_delay(start + MAX_RECONNECT_WINDOW - Duration::from_millis(1)) {
            RetryDecision::Retry(delay) => assert!(delay <= RETRY_SPACING),
            other => panic!("expected Retry, got {other:?}"),
        }

        // Exactly at the deadline the window expires and clears.
        assert_eq!(
            strategy.next_delay(start + MAX_RECONNECT_WINDOW),
            RetryDecision::Expired
        );
        assert!(!strategy.is_reconnecting());
        assert_eq!(
            strategy.next_delay(start + MAX_RECONNECT_WINDOW),
            RetryDecision::NotReconnecting
        );
    }

    #[test]
    fn test_retry_spacing_from_attempt() {
        let mut strategy = ReconnectStrategy::new();
        let start = Instant::now();
        strategy.begin_window(start);

        // Immediately after opening, the full spacing applies.
        assert_eq!(
            strategy.next_delay(start),
            RetryDecision::Retry(RETRY_SPACING)
        );

        // An attempt at t+5s restarts the spacing clock only.
        let attempt = start + Duration::from_secs(5);
        strategy.mark_attempt(attempt);
        assert_eq!(
            strategy.next_delay(attempt + Duration::from_secs(1)),
            RetryDecision::Retry(Duration::from_secs(2))
        );

        // Past the spacing the delay clamps to zero.
        assert_eq!(
            strategy.next_delay(attempt + Duration::from_secs(4)),
            RetryDecision::Retry(Duration::ZERO)
        );
    }

    #[test]
    fn test_end_window_reports_activity() {
        let mut strategy = ReconnectStrategy::new();
        assert!(!strategy.end_window());

        strategy.begin_window(Instant::now());
        assert!(strategy.end_window());
        assert!(!strategy.end_window());
    }

    #[test]
    fn test_mark_attempt_outside_window_is_noop() {
        let mut strategy = ReconnectStrategy::new();
        strategy.mark_attempt(Instant::now());
        assert_eq!(
            strategy.next_delay(Instant::now()),
            RetryDecision::NotReconnecting
        );
    }
}
