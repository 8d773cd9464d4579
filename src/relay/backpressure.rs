//! Hysteresis between a relay's read side and its session's send buffer.
//!
//! Reading pauses when the session's buffered bytes reach the high
//! watermark and resumes only once they fall to the low watermark.

// ============================================================================
// Imports
// ============================================================================

use crate::config::RelayConfig;

// ============================================================================
// Transition
// ============================================================================

/// State change produced by a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Reading stopped.
    Paused,
    /// Reading restarted.
    Resumed,
}

// ============================================================================
// Backpressure
// ============================================================================

/// Pause/resume state with distinct low and high thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backpressure {
    low: usize,
    high: usize,
    paused: bool,
}

impl Backpressure {
    /// Creates an unpaused tracker. `low` must be below `high`.
    #[must_use]
    pub fn new(low: usize, high: usize) -> Self {
        debug_assert!(low < high, "low watermark must be below high watermark");
        Self {
            low,
            high,
            paused: false,
        }
    }

    /// Creates a tracker from relay settings.
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.low_watermark, config.high_watermark)
    }

    /// Returns `true` while reading is paused.
    #[inline]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Feeds the current buffered byte count.
    pub fn check(&mut self, buffered: usize) -> Option<Transition> {
        if !self.paused && buffered >= self.high {
            self.paused = true;
            return Some(Transition::Paused);
        }
        if self.paused && buffered <= self.low {
            self.paused = false;
            return Some(Transition::Resumed);
        }
        None
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_pause_at_high_resume_at_low() {
        let mut bp = Backpressure::new(10, 100);
        assert_eq!(bp.check(99), None);
        assert_eq!(bp.check(100), Some(Transition::Paused));
        assert_eq!(bp.check(150), None);
        assert_eq!(bp.check(99), None);
        assert_eq!(bp.check(11), None);
        assert!(bp.is_paused());
        assert_eq!(bp.check(10), Some(Transition::Resumed));
        assert_eq!(bp.check(50), None);
        assert!(!bp.is_paused());
    }

    #[test]
    fn test_defaults_from_config() {
        let mut bp = Backpressure::from_config(&RelayConfig::default());
        assert_eq!(bp.check((1 << 24) - 1), None);
        assert_eq!(bp.check(1 << 24), Some(Transition::Paused));
        assert_eq!(bp.check((1 << 23) + 1), None);
        assert_eq!(bp.check(1 << 23), Some(Transition::Resumed));
    }

    proptest! {
        #[test]
        fn prop_transitions_only_at_watermarks(levels in prop::collection::vec(0usize..200, 1..64)) {
            let mut bp = Backpressure::new(40, 120);
            for level in levels {
                let was_paused = bp.is_paused();
                match bp.check(level) {
                    Some(Transition::Paused) => prop_assert!(!was_paused && level >= 120),
                    Some(Transition::Resumed) => prop_assert!(was_paused && level <= 40),
                    None => {
                        let inside_band = if was_paused { level > 40 } else { level < 120 };
                        prop_assert!(inside_band);
                    }
                }
            }
        }
    }
}
