//! Request tracking with deadlines.
//!
//! Each logical operation (launch, load, seek, ...) owns one
//! [`RequestTracker`] holding at most a single outstanding request.
//! Completion happens exactly once, either through a matching reply or
//! through the periodic timeout sweep, whichever comes first.

use crate::status::CastStatus;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Callback invoked exactly once when a tracked request completes
pub type TrackerCallback = Box<dyn FnOnce(i64, CastStatus, Option<Value>) + Send + Sync>;

struct Tracked {
    request_id: i64,
    started_at: Instant,
    callback: TrackerCallback,
}

/// Tracks at most one outstanding request for a logical operation slot
#[derive(Default)]
pub struct RequestTracker {
    slot: Option<Tracked>,
}

impl RequestTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request, stamping the current time.
    ///
    /// Any previously tracked request is replaced and its callback is
    /// discarded without being invoked. This mirrors the behavior of
    /// the callers this engine serves; do not "fix" it here.
    pub fn track(&mut self, request_id: i64, now: Instant, callback: TrackerCallback) {
        self.slot = Some(Tracked {
            request_id,
            started_at: now,
            callback,
        });
    }

    /// Whether a request is outstanding
    pub fn is_outstanding(&self) -> bool {
        self.slot.is_some()
    }

    /// Whether the given id is the tracked one
    pub fn is_current(&self, request_id: i64) -> bool {
        self.slot
            .as_ref()
            .map(|t| t.request_id == request_id)
            .unwrap_or(false)
    }

    /// Complete the tracked request if `request_id` matches.
    ///
    /// The slot is cleared before the callback runs, so a re-entrant
    /// completion cannot fire twice. Returns whether the callback fired.
    pub fn complete(&mut self, request_id: i64, status: CastStatus, extra: Option<Value>) -> bool {
        if !self.is_current(request_id) {
            return false;
        }
        let tracked = self.slot.take().expect("checked above");
        (tracked.callback)(request_id, status, extra);
        true
    }

    /// Complete whatever request is outstanding, regardless of id.
    ///
    /// Used for channel-wide broadcast failures, where a receiver-side
    /// error resolves every outstanding operation at once.
    pub fn complete_outstanding(&mut self, status: CastStatus, extra: Option<Value>) -> bool {
        match self.slot.take() {
            Some(tracked) => {
                (tracked.callback)(tracked.request_id, status, extra);
                true
            }
            None => false,
        }
    }

    /// Expire the tracked request if its deadline has passed.
    ///
    /// Returns whether the timeout fired.
    pub fn sweep(&mut self, now: Instant, timeout: Duration, timeout_status: CastStatus) -> bool {
        let expired = self
            .slot
            .as_ref()
            .map(|t| now.duration_since(t.started_at) >= timeout)
            .unwrap_or(false);
        if !expired {
            return false;
        }
        let tracked = self.slot.take().expect("checked above");
        (tracked.callback)(tracked.request_id, timeout_status, None);
        true
    }

    /// Clear the slot without invoking the callback (disconnect path)
    pub fn reset(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> TrackerCallback {
        let counter = counter.clone();
        Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_single_slot_replacement() {
        let mut tracker = RequestTracker::new();
        let fired_a = Arc::new(AtomicUsize::new(0));
        let fired_b = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        tracker.track(1, now, counting_callback(&fired_a));
        tracker.track(2, now, counting_callback(&fired_b));

        assert!(!tracker.is_current(1));
        assert!(tracker.is_current(2));

        // Completing the replaced id is a no-op; the dropped callback
        // never fires.
        assert!(!tracker.complete(1, CastStatus::Ok, None));
        assert!(tracker.complete(2, CastStatus::Ok, None));
        assert_eq!(fired_a.load(Ordering::SeqCst), 0);
        assert_eq!(fired_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_at_most_once_completion() {
        let mut tracker = RequestTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        tracker.track(7, now, counting_callback(&fired));
        assert!(tracker.complete(7, CastStatus::Ok, None));
        assert!(!tracker.complete(7, CastStatus::Ok, None));
        assert!(!tracker.sweep(
            now + Duration::from_secs(60),
            Duration::from_secs(10),
            CastStatus::Timeout
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sweep_fires_after_deadline() {
        let mut tracker = RequestTracker::new();
        let now = Instant::now();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_clone = seen.clone();

        tracker.track(
            3,
            now,
            Box::new(move |id, status, _| {
                *seen_clone.lock().unwrap() = Some((id, status));
            }),
        );

        let timeout = Duration::from_secs(10);
        assert!(!tracker.sweep(now + Duration::from_secs(9), timeout, CastStatus::Timeout));
        assert!(tracker.sweep(now + Duration::from_secs(10), timeout, CastStatus::Timeout));
        assert_eq!(*seen.lock().unwrap(), Some((3, CastStatus::Timeout)));
        assert!(!tracker.is_outstanding());
    }

    #[test]
    fn test_reset_drops_callback_silently() {
        let mut tracker = RequestTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));

        tracker.track(5, Instant::now(), counting_callback(&fired));
        tracker.reset();

        assert!(!tracker.is_outstanding());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
