//! Debounced scheduling of recompute passes.
//!
//! The engine is single-threaded and never sleeps: a write schedules (or reschedules) one
//! pending pass, and the host drives execution by calling [`crate::Engine::tick`] from its own
//! loop (using [`crate::Engine::next_deadline`] to decide when) or [`crate::Engine::flush`].

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Source of the current time for debounce deadlines.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    elapsed: Rc<Cell<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed.get()
    }
}

/// The single not-yet-run pass of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPass {
    /// Input fields written since the last pass, in first-write order.
    pub changed: Vec<String>,
    pub deadline: Instant,
    /// Number of writes coalesced into this pass.
    pub requests: usize,
}

/// Schedule-then-reschedule primitive: a new request supersedes the pending one.
///
/// Every request pushes the deadline back to `now + window`; the changed-field sets of
/// superseded requests are merged, so coalescing never loses a field that needs recompute.
pub struct Debouncer {
    window: Duration,
    pending: Option<PendingPass>,
}

impl fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("window", &self.window)
            .field("pending", &self.pending.as_ref().map(|p| &p.changed))
            .finish()
    }
}

impl Debouncer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    /// Record a change to `field` at `now` and (re)arm the deadline. Returns the new deadline.
    pub fn schedule(&mut self, field: &str, now: Instant) -> Instant {
        let deadline = now + self.window;
        match &mut self.pending {
            Some(pending) => {
                if !pending.changed.iter().any(|f| f == field) {
                    pending.changed.push(field.to_string());
                }
                pending.deadline = deadline;
                pending.requests += 1;
            }
            None => {
                self.pending = Some(PendingPass {
                    changed: vec![field.to_string()],
                    deadline,
                    requests: 1,
                });
            }
        }
        deadline
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Take the pending pass if its deadline has been reached.
    pub fn take_due(&mut self, now: Instant) -> Option<PendingPass> {
        match &self.pending {
            Some(pending) if pending.deadline <= now => self.pending.take(),
            _ => None,
        }
    }

    /// Take the pending pass regardless of its deadline.
    pub fn take(&mut self) -> Option<PendingPass> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WINDOW: Duration = Duration::from_millis(200);

    #[test]
    fn burst_is_coalesced_into_one_pass() {
        let clock = ManualClock::new();
        let mut debouncer = Debouncer::new(WINDOW);

        debouncer.schedule("a", clock.now());
        clock.advance(Duration::from_millis(50));
        debouncer.schedule("a", clock.now());
        clock.advance(Duration::from_millis(50));
        debouncer.schedule("b", clock.now());

        // The window restarted with the last write.
        clock.advance(Duration::from_millis(150));
        assert_eq!(debouncer.take_due(clock.now()), None);

        clock.advance(Duration::from_millis(50));
        let pass = debouncer.take_due(clock.now()).expect("pass due");
        assert_eq!(pass.changed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(pass.requests, 3);
        assert!(!debouncer.is_pending());
    }

    #[test]
    fn take_ignores_deadline() {
        let clock = ManualClock::new();
        let mut debouncer = Debouncer::new(WINDOW);

        let deadline = debouncer.schedule("x", clock.now());
        assert_eq!(debouncer.next_deadline(), Some(deadline));
        assert!(debouncer.take().is_some());
        assert_eq!(debouncer.next_deadline(), None);
        assert!(debouncer.take().is_none());
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = other.now();
        clock.advance(Duration::from_secs(1));
        assert_eq!(other.now() - start, Duration::from_secs(1));
    }
}
