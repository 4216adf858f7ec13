//! Next-batch range calculation for the sync cursor.

use crate::jobs::BlockRange;

/// `min(current - delay, last + batch, end)`, never below `last`.
pub fn compute_target_block(last: u64, current: u64, batch_size: u64, delay: u64, end: Option<u64>) -> u64 {
    let head = current.saturating_sub(delay);
    let target = head
        .min(last.saturating_add(batch_size))
        .min(end.unwrap_or(u64::MAX));
    target.max(last)
}

/// Range following `cursor`, or `None` when there is nothing to sync.
///
/// A `None` cursor means no block was synced yet and the range starts at 0.
pub fn next_range(
    cursor: Option<u64>,
    current: u64,
    batch_size: u64,
    delay: u64,
    end: Option<u64>,
) -> Option<BlockRange> {
    let batch_size = batch_size.max(1);
    match cursor {
        Some(last) => {
            let target = compute_target_block(last, current, batch_size, delay, end);
            (target > last).then(|| BlockRange::new(last + 1, target))
        }
        None => {
            let head = current.checked_sub(delay)?;
            let target = head.min(batch_size - 1).min(end.unwrap_or(u64::MAX));
            Some(BlockRange::new(0, target))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_without_end_bound() {
        for last in [0u64, 5, 100, 1_000] {
            for current in [0u64, 3, 100, 105, 2_000] {
                for batch in [1u64, 10, 500] {
                    let target = compute_target_block(last, current, batch, 0, None);
                    let expected = current.min(last + batch).max(last);
                    assert_eq!(target, expected, "last={} current={} batch={}", last, current, batch);
                    assert!(target >= last);
                }
            }
        }
    }

    #[test]
    fn test_delay_and_end_bound() {
        assert_eq!(compute_target_block(100, 200, 50, 120, None), 100);
        assert_eq!(compute_target_block(100, 200, 50, 60, None), 140);
        assert_eq!(compute_target_block(100, 200, 50, 0, Some(120)), 120);
        assert_eq!(compute_target_block(100, 200, 50, 0, Some(90)), 100);
    }

    #[test]
    fn test_next_range() {
        assert_eq!(next_range(Some(9), 100, 10, 0, None), Some(BlockRange::new(10, 19)));
        assert_eq!(next_range(Some(100), 100, 10, 0, None), None);
        assert_eq!(next_range(Some(95), 100, 10, 2, None), Some(BlockRange::new(96, 98)));
        assert_eq!(next_range(Some(9), 100, 10, 0, Some(12)), Some(BlockRange::new(10, 12)));
    }

    #[test]
    fn test_next_range_from_genesis() {
        assert_eq!(next_range(None, 100, 10, 0, None), Some(BlockRange::new(0, 9)));
        assert_eq!(next_range(None, 3, 10, 0, None), Some(BlockRange::new(0, 3)));
        assert_eq!(next_range(None, 3, 10, 5, None), None);
        assert_eq!(next_range(None, 100, 0, 0, None), Some(BlockRange::new(0, 0)));
    }
}
