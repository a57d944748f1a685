//! Debug assertion macros for the core pipeline's invariants.
//!
//! Active only in debug builds (`#[cfg(debug_assertions)]`), so there is
//! zero overhead in release builds.

/// INV-PRISON-01: a cell's reference count never goes negative and is zero
/// exactly when the cell is about to be unlinked.
macro_rules! debug_assert_cell_count_consistent {
    ($count:expr) => {
        debug_assert!(
            $count >= 1,
            "INV-PRISON-01 violated: cell released with non-positive count {}",
            $count
        )
    };
}

/// INV-PRISON-02: every bio handed to `release`/`fail` is observed exactly
/// once downstream.
macro_rules! debug_assert_queue_drained {
    ($queue:expr) => {
        debug_assert!(
            $queue.is_empty(),
            "INV-PRISON-02 violated: cell queue not fully drained after release"
        )
    };
}

/// INV-DEFER-01: the sweeper index never passes the current index without
/// first observing a zero count at every slot in between.
macro_rules! debug_assert_sweeper_not_past_current {
    ($sweeper:expr, $current:expr, $size:expr) => {
        debug_assert!(
            $sweeper < $size && $current < $size,
            "INV-DEFER-01 violated: index out of range (sweeper {}, current {}, size {})",
            $sweeper,
            $current,
            $size
        )
    };
}

/// INV-MAP-01: a new-mapping record is posted to the prepared queue only
/// once `prepared` is set and the deferred-set gate has released it.
macro_rules! debug_assert_prepared_before_post {
    ($prepared:expr) => {
        debug_assert!(
            $prepared,
            "INV-MAP-01 violated: mapping record posted before prepared"
        )
    };
}

pub(crate) use debug_assert_cell_count_consistent;
pub(crate) use debug_assert_prepared_before_post;
pub(crate) use debug_assert_queue_drained;
pub(crate) use debug_assert_sweeper_not_past_current;
