//! One-shot deadlines for the buffer manager
//!
//! The manager never sleeps. It arms deadlines here and the event loop wakes
//! it at `next_deadline()`, the same way the sync engine's select loop waits
//! on an optional `sleep_until`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Async stop must be acknowledged within this window
pub const BUFFER_STOP_TIMEOUT: Duration = Duration::from_secs(3);
/// A save must be acknowledged within this window
pub const SAVE_TIMEOUT: Duration = Duration::from_secs(30);
/// Minimum spacing between accepted saves
pub const SAVE_COOLDOWN: Duration = Duration::from_millis(2000);
/// Delay between a finished save and the buffer reset
pub const POST_SAVE_RESET_DELAY: Duration = Duration::from_millis(200);
/// How long after an in-place restart the output must be running
pub const RESET_VERIFY_DELAY: Duration = Duration::from_millis(500);
/// Delay before a full restart after a failed reset
pub const DELAYED_START_DELAY: Duration = Duration::from_millis(500);
/// Encoder settings are re-applied this long after the output starts
pub const ENCODER_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    BufferStop,
    SaveTimeout,
    PostSaveReset,
    ResetVerify,
    DelayedStart,
    EncoderSettle,
}

/// At most one pending deadline per kind
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerKind, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer to fire `after` from now
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.deadlines.insert(kind, Instant::now() + after);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines.remove(&kind);
    }

    #[cfg(test)]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(kind, deadline)| (*deadline, *kind))
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);

        for (_, kind) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn due_timers_fire_in_deadline_order() {
        let mut timers = Timers::new();
        timers.arm(TimerKind::SaveTimeout, SAVE_TIMEOUT);
        timers.arm(TimerKind::BufferStop, BUFFER_STOP_TIMEOUT);
        timers.arm(TimerKind::EncoderSettle, ENCODER_SETTLE_DELAY);

        assert!(timers.take_due(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(3)).await;
        let due = timers.take_due(Instant::now());
        assert_eq!(due, vec![TimerKind::EncoderSettle, TimerKind::BufferStop]);
        assert!(timers.is_armed(TimerKind::SaveTimeout));
        assert!(!timers.is_armed(TimerKind::BufferStop));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_deadline() {
        let mut timers = Timers::new();
        timers.arm(TimerKind::DelayedStart, Duration::from_secs(10));
        timers.arm(TimerKind::DelayedStart, DELAYED_START_DELAY);

        assert_eq!(
            timers.next_deadline(),
            Some(Instant::now() + DELAYED_START_DELAY)
        );

        timers.cancel(TimerKind::DelayedStart);
        assert_eq!(timers.next_deadline(), None);
    }
}
