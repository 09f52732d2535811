//! Overflow & back-pressure controller (spec §4.5).
//!
//! `OverflowState` is guarded by its own lock, deliberately separate from
//! the engine mutex, so a waiter blocked on ring space can still have its
//! drop count observed and paired with a `RECOVER` marker by a consumer
//! thread that is draining concurrently. Lock order is always the engine
//! mutex first, this lock second, never the reverse — callers that need
//! both hold the engine mutex across their `OverflowState` access rather
//! than the other way around.

use std::sync::Mutex;

/// Mount option selecting what happens when a record cannot fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the record, log an `OVERFLOW` marker, return success.
    #[default]
    Drop,
    /// Block the caller until space frees up or the policy changes.
    Wait,
}

#[derive(Debug, Default)]
struct Counters {
    num_dropped: u32,
    extra_space: u64,
}

/// The drop counter and accumulated shortfall, queue-lock protected.
#[derive(Debug, Default)]
pub struct OverflowState {
    counters: Mutex<Counters>,
}

/// What the caller must do in response to an overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowAction {
    /// This is the first overflow since the last recovery: emit the
    /// `OVERFLOW` marker before proceeding.
    EmitMarker,
    /// A marker is already outstanding; nothing further to log.
    AlreadyMarked,
}

impl OverflowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more dropped (or deferred) record of `record_len` bytes
    /// and reports whether this is the transition that needs an `OVERFLOW`
    /// marker (spec §4.5 steps 1–2).
    pub fn on_overflow(&self, record_len: u64) -> OverflowAction {
        let mut c = self.counters.lock().unwrap();
        let was_zero = c.num_dropped == 0;
        c.num_dropped += 1;
        c.extra_space += record_len;
        if was_zero { OverflowAction::EmitMarker } else { OverflowAction::AlreadyMarked }
    }

    pub fn num_dropped(&self) -> u32 {
        self.counters.lock().unwrap().num_dropped
    }

    /// Zeroes both counters and returns their values immediately prior, for
    /// the caller to fold into a `RECOVER` marker.
    pub fn take_for_recovery(&self) -> (u32, u64) {
        let mut c = self.counters.lock().unwrap();
        let result = (c.num_dropped, c.extra_space);
        c.num_dropped = 0;
        c.extra_space = 0;
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_overflow_requests_a_marker() {
        let state = OverflowState::new();
        assert_eq!(state.on_overflow(64), OverflowAction::EmitMarker);
        assert_eq!(state.on_overflow(64), OverflowAction::AlreadyMarked);
        assert_eq!(state.num_dropped(), 2);
    }

    #[test]
    fn recovery_drains_and_resets() {
        let state = OverflowState::new();
        state.on_overflow(100);
        state.on_overflow(200);
        let (dropped, extra) = state.take_for_recovery();
        assert_eq!(dropped, 2);
        assert_eq!(extra, 300);
        assert_eq!(state.num_dropped(), 0);
        assert_eq!(state.on_overflow(1), OverflowAction::EmitMarker);
    }
}
