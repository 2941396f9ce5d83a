//! Monotonic-with-tolerance reconciliation of reported playback positions.

/// Small backward jumps within this window are treated as decoder jitter
/// and ignored; anything further back is an intentional seek.
pub const SEEK_BACKWARD_TOLERANCE_SECS: f64 = 0.75;

const UNSET: f64 = -1.0;

/// Tracks the last position published to the OS widget and filters out
/// spurious backward jumps from the incoming stream.
#[derive(Debug)]
pub struct PositionTracker {
    last_reported: f64,
}

impl Default for PositionTracker {
    fn default() -> Self {
        PositionTracker {
            last_reported: UNSET,
        }
    }
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciles an incoming position against the last published one and
    /// returns the value to publish.
    ///
    /// Non-finite input sanitizes to 0.0 and negatives clamp to 0.0 before
    /// the comparison. A backward move of strictly more than the tolerance
    /// keeps the previous value; a move of exactly the tolerance is
    /// accepted.
    pub fn apply(&mut self, incoming: f64) -> f64 {
        let clamped = if incoming.is_finite() {
            incoming.max(0.0)
        } else {
            0.0
        };
        if self.last_reported >= 0.0 && clamped + SEEK_BACKWARD_TOLERANCE_SECS < self.last_reported
        {
            return self.last_reported;
        }
        self.last_reported = clamped;
        clamped
    }

    /// Forgets the published position. Called on track or epoch changes so
    /// the next report is always accepted.
    pub fn reset(&mut self) {
        self.last_reported = UNSET;
    }

    pub fn last_published(&self) -> Option<f64> {
        if self.last_reported >= 0.0 {
            Some(self.last_reported)
        } else {
            None
        }
    }
}
