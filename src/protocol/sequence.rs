//! Frame loss accounting from the wrapping 16-bit sequence counter.

use serde::Serialize;

use super::SEQUENCE_DISCONTINUITY_THRESHOLD;

/// What a single sequence number said about the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    /// First frame after construction or reset
    First,
    /// Exactly the expected next number
    InOrder,
    /// Forward gap within the loss window; carries the number of missing frames
    Lost(u16),
    /// Gap too large to be loss (device restart, reconnect, reordering)
    Discontinuity,
}

/// Running counters exposed to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequenceStats {
    /// Frames observed since the last discontinuity
    pub received: u64,
    /// Frames missing since the last discontinuity
    pub lost: u64,
    /// Discontinuities since the tracker was created
    pub discontinuities: u64,
}

/// Tracks the expected next sequence number.
///
/// Gaps are computed modulo 65536 against `last + 1`, so 100 -> 105 loses 4
/// frames and 65535 -> 0 loses none. A gap above
/// [`SEQUENCE_DISCONTINUITY_THRESHOLD`] restarts the loss accounting instead of
/// being counted.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u16>,
    stats: SequenceStats,
}

impl SequenceTracker {
    /// Tracker waiting for its first frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one sequence number.
    pub fn observe(&mut self, sequence: u16) -> SequenceEvent {
        let Some(last) = self.last.replace(sequence) else {
            self.stats.received = 1;
            return SequenceEvent::First;
        };

        let gap = sequence.wrapping_sub(last.wrapping_add(1));
        if gap == 0 {
            self.stats.received += 1;
            SequenceEvent::InOrder
        } else if gap <= SEQUENCE_DISCONTINUITY_THRESHOLD {
            self.stats.received += 1;
            self.stats.lost += u64::from(gap);
            SequenceEvent::Lost(gap)
        } else {
            tracing::debug!(last, sequence, "Sequence discontinuity, loss accounting reset");
            self.stats.received = 1;
            self.stats.lost = 0;
            self.stats.discontinuities += 1;
            SequenceEvent::Discontinuity
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> SequenceStats {
        self.stats
    }

    /// Forgets the last sequence number and zeroes loss counters.
    pub fn reset(&mut self) {
        self.last = None;
        self.stats.received = 0;
        self.stats.lost = 0;
    }
}
