use super::types::BlockRange;

/// Computes the next range to request after `last_issued`.
///
/// The range starts right after `last_issued`, spans at most `step` blocks and never crosses
/// `confirmed_head`. Returns `None` once everything up to the confirmed head has been issued.
pub fn next_interval(last_issued: i64, step: i64, confirmed_head: i64) -> Option<BlockRange> {
    let from_block = last_issued.saturating_add(1);
    if from_block > confirmed_head {
        return None;
    }

    let to_block = last_issued.saturating_add(step.max(1)).min(confirmed_head);
    Some(BlockRange::new(from_block, to_block))
}

#[cfg(test)]
mod tests {
    use super::next_interval;
    use crate::pipeline::types::BlockRange;

    #[test]
    fn clamps_to_confirmed_head() {
        assert_eq!(
            next_interval(1000, 50, 1040),
            Some(BlockRange::new(1001, 1040))
        );
    }

    #[test]
    fn uses_full_step_when_head_is_far_ahead() {
        assert_eq!(
            next_interval(1000, 50, 5000),
            Some(BlockRange::new(1001, 1050))
        );
    }

    #[test]
    fn returns_none_when_fully_issued() {
        assert_eq!(next_interval(1040, 50, 1040), None);
        assert_eq!(next_interval(1041, 50, 1040), None);
    }

    #[test]
    fn single_block_range_at_head() {
        assert_eq!(next_interval(99, 10, 100), Some(BlockRange::new(100, 100)));
    }

    #[test]
    fn genesis_cursor_starts_at_block_zero() {
        assert_eq!(next_interval(-1, 10, 3), Some(BlockRange::new(0, 3)));
    }

    #[test]
    fn non_positive_step_still_makes_progress() {
        assert_eq!(next_interval(7, 0, 100), Some(BlockRange::new(8, 8)));
    }

    #[test]
    fn invariants_hold_across_a_grid_of_inputs() {
        for last_issued in -1..40 {
            for step in 1..12 {
                for confirmed_head in -1..40 {
                    match next_interval(last_issued, step, confirmed_head) {
                        Some(range) => {
                            assert!(last_issued < confirmed_head);
                            assert_eq!(range.from_block, last_issued + 1);
                            assert!(range.to_block <= confirmed_head);
                            assert!(range.to_block - range.from_block < step);
                            assert!(range.validate().is_ok());
                        }
                        None => assert!(last_issued >= confirmed_head),
                    }
                }
            }
        }
    }
}
