//! Per-block lifecycle record and retry timer.

use std::time::Duration;

use tokio::time::Instant;

/// Delay assigned to a freshly put block and restored after a success.
pub const INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Retry delays wrap around at this many seconds.
pub const DELAY_WRAP_SECS: u64 = 3600;

/// Growth factor applied to the retry delay on every failure: (1 + √5) / 2.
pub const GOLDEN_RATIO: f64 = 1.618_033_988_749_895;

/// Compute the delay that follows `delay` after a failed attempt.
///
/// `round(delay.seconds × φ) mod 3600` seconds.
pub fn next_delay(delay: Duration) -> Duration {
    let grown = (delay.as_secs_f64() * GOLDEN_RATIO).round() as u64;
    Duration::from_secs(grown % DELAY_WRAP_SECS)
}

/// Lifecycle position derived from a [`BlockState`]'s flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPhase {
    /// Unconfirmed processing is running.
    UnconfirmedInProgress,
    /// Unconfirmed processing failed, waiting for a retry.
    UnconfirmedWaiting,
    /// Unconfirmed processing succeeded, waiting for confirmation depth or a
    /// confirmed retry.
    ConfirmedWaiting,
    /// Confirmed processing is running.
    ConfirmedInProgress,
    /// Fully processed.
    ConfirmedDone,
}

/// Progress of one block through the unconfirmed and confirmed phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockState {
    pub unconfirmed_progress: bool,
    pub unconfirmed_done: bool,
    /// Gates broker publication; set once, never cleared.
    pub published: bool,
    /// Set once the block's records were persisted at least once.
    pub inserted: bool,
    pub confirmed_progress: bool,
    pub confirmed_done: bool,
    pub last_attempted: Instant,
    pub delay: Duration,
}

impl BlockState {
    /// State of a block that was just accepted; the caller owns the first
    /// unconfirmed attempt.
    pub fn new(now: Instant) -> Self {
        Self {
            unconfirmed_progress: true,
            unconfirmed_done: false,
            published: false,
            inserted: false,
            confirmed_progress: false,
            confirmed_done: false,
            last_attempted: now,
            delay: INITIAL_DELAY,
        }
    }

    /// Grow the retry delay after a failure.
    pub fn set_delay(&mut self) {
        self.delay = next_delay(self.delay);
    }

    /// Restore the initial delay after a success.
    pub fn reset_delay(&mut self) {
        self.delay = INITIAL_DELAY;
    }

    pub fn set_last_attempted(&mut self, now: Instant) {
        self.last_attempted = now;
    }

    /// Whether the retry delay since the last attempt has elapsed.
    pub fn can_attempt(&self, now: Instant) -> bool {
        now >= self.last_attempted + self.delay
    }

    pub fn phase(&self) -> BlockPhase {
        if self.confirmed_done {
            BlockPhase::ConfirmedDone
        } else if self.confirmed_progress {
            BlockPhase::ConfirmedInProgress
        } else if self.unconfirmed_done {
            BlockPhase::ConfirmedWaiting
        } else if self.unconfirmed_progress {
            BlockPhase::UnconfirmedInProgress
        } else {
            BlockPhase::UnconfirmedWaiting
        }
    }

    /// Eligible for an unconfirmed (re)attempt, ignoring the timer.
    pub(crate) fn awaits_unconfirmed(&self) -> bool {
        self.phase() == BlockPhase::UnconfirmedWaiting
    }

    /// Eligible for a confirmed (re)attempt, ignoring the timer and depth.
    pub(crate) fn awaits_confirmed(&self) -> bool {
        self.phase() == BlockPhase::ConfirmedWaiting
    }
}
