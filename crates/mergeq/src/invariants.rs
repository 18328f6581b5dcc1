//! Debug assertion macros for merge-group invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so release
//! builds pay nothing for them.

// =============================================================================
// Lifecycles only move forward
// Queue: Open -> Draining -> Closed
// Bridge: Unlinked -> Active -> Terminal
// =============================================================================

/// Assert that a lifecycle transition only moves forward.
///
/// Used in: `Queue::finish()` when moving to `Closed`, `Bridge::terminate()`
macro_rules! debug_assert_forward_transition {
    ($old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "state moved backwards from {} to {}",
            $old,
            $new
        )
    };
}

// =============================================================================
// Counter: active count never goes negative
// =============================================================================

/// Assert that a producer release had a matching reservation.
///
/// **Invariant**: `active` is decremented exactly once per counted producer.
///
/// Used in: `Counter::release()`
macro_rules! debug_assert_release_matched {
    ($previous:expr) => {
        debug_assert!(
            $previous > 0,
            "producer released with active count already at zero"
        )
    };
}

// =============================================================================
// Admission: live links never exceed the ceiling
// =============================================================================

/// Assert that the link registry respects the admission ceiling.
///
/// Used in: `Counter::admit()` after inserting a link
macro_rules! debug_assert_within_ceiling {
    ($links:expr, $ceiling:expr) => {
        debug_assert!(
            $links <= $ceiling,
            "{} links registered with admission ceiling {}",
            $links,
            $ceiling
        )
    };
}

pub(crate) use debug_assert_forward_transition;
pub(crate) use debug_assert_release_matched;
pub(crate) use debug_assert_within_ceiling;
