//! Type-safe identifiers for sessions and relays.
//!
//! Signatures are process-unique and only used for log correlation.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Signature
// ============================================================================

/// Global counter shared by every signature in the process.
static NEXT_SIGNATURE: AtomicU64 = AtomicU64::new(1);

/// Process-unique signature of a session or relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(u64);

impl Signature {
    /// Allocates the next signature.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SIGNATURE.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures_are_unique() {
        let a = Signature::next();
        let b = Signature::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_display_is_hex() {
        assert_eq!(Signature(255).to_string(), "ff");
    }
}
