//! Backpressure counters and heartbeat bookkeeping.

use std::time::Duration;

use tokio::time::Instant;

/// Consecutive missed pongs that put a session in the error state.
pub const MAX_MISSED_PONGS: u32 = 3;

/// Messages sent to the client versus messages it acknowledged.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FlowCounters {
    pub(crate) sent: u64,
    pub(crate) acknowledged: u64,
}

impl FlowCounters {
    pub(crate) fn record_sent(&mut self) {
        self.sent = self.sent.saturating_add(1);
    }

    /// Acknowledged never exceeds sent; extra acks are dropped.
    pub(crate) fn record_acknowledged(&mut self, count: u64) {
        self.acknowledged = self.acknowledged.saturating_add(count).min(self.sent);
    }

    pub(crate) fn outstanding(&self) -> u64 {
        self.sent - self.acknowledged
    }

    /// Backpressure decision with hysteresis.
    ///
    /// `Some(true)` once the gap reaches `max`, `Some(false)` once it falls
    /// below `max / 2`, `None` in between (keep the current state).
    pub(crate) fn evaluate(&self, max: u64) -> Option<bool> {
        let gap = self.outstanding();
        if gap >= max {
            Some(true)
        } else if gap < max / 2 {
            Some(false)
        } else {
            None
        }
    }
}

/// Result of a periodic heartbeat check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatCheck {
    /// Heartbeating is not enabled yet
    Disabled,
    /// No pong overdue
    Healthy,
    /// A pong is overdue; carries the consecutive miss count
    Missed(u32),
    /// Too many consecutive misses, the session is in the error state
    TimedOut,
}

/// Ping/pong timestamps of one session.
#[derive(Debug, Default)]
pub(crate) struct Heartbeat {
    pub(crate) last_ping_sent_at: Option<Instant>,
    pub(crate) missed_pongs: u32,
    next_seq: u64,
}

impl Heartbeat {
    /// Records a ping sent now and returns its sequence number.
    ///
    /// While an earlier ping is unanswered its wait window is kept: only a
    /// pong or a counted miss restarts it.
    pub(crate) fn ping_sent(&mut self, now: Instant) -> u64 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.last_ping_sent_at.get_or_insert(now);
        self.next_seq
    }

    pub(crate) fn pong_received(&mut self) {
        self.last_ping_sent_at = None;
        self.missed_pongs = 0;
    }

    /// Counts a miss if the outstanding ping is older than `timeout`.
    ///
    /// A miss restarts the wait window, so consecutive misses are each
    /// separated by more than `timeout`. Returns the miss count when one
    /// was recorded.
    pub(crate) fn overdue(&mut self, now: Instant, timeout: Duration) -> Option<u32> {
        let sent_at = self.last_ping_sent_at?;
        if now.saturating_duration_since(sent_at) <= timeout {
            return None;
        }
        self.missed_pongs += 1;
        self.last_ping_sent_at = Some(now);
        Some(self.missed_pongs)
    }

    pub(crate) fn reset(&mut self) {
        self.last_ping_sent_at = None;
        self.missed_pongs = 0;
    }
}
