//! Difficulty retargeting.
//!
//! Two algorithms, selected by height. The classic windowed retarget serves
//! the chain up to the second hard fork; a correction active from the first
//! hard fork recomputes over the untrimmed tail of 17 blocks and floors the
//! result. Past the second hard fork a weighted (LWMA-style) average over
//! the last 120 solve times takes over.

use crate::currency::Currency;
use nacre_primitives::{CumulativeDifficulty, Difficulty, Height, Timestamp};

impl Currency {
    /// Difficulty required for the block at `block_index`, given the recent
    /// `timestamps` and `cumulative_difficulties`, oldest first. Both slices
    /// cover the same blocks. Returns 0 on arithmetic overflow, which the
    /// block validator reports as `DIFFICULTY_OVERHEAD`.
    pub fn next_difficulty(
        &self,
        block_index: Height,
        timestamps: &[Timestamp],
        cumulative_difficulties: &[CumulativeDifficulty],
    ) -> Difficulty {
        debug_assert_eq!(timestamps.len(), cumulative_difficulties.len());
        if block_index <= self.hardfork_v2_height {
            self.next_difficulty_v1(block_index, timestamps, cumulative_difficulties)
        } else {
            self.next_difficulty_v2(timestamps, cumulative_difficulties)
        }
    }

    /// Classic windowed retarget: sort timestamps, trim `difficulty_cut`
    /// outliers from each side, divide work in the window by its time span.
    fn next_difficulty_v1(
        &self,
        block_index: Height,
        timestamps: &[Timestamp],
        cumulative_difficulties: &[CumulativeDifficulty],
    ) -> Difficulty {
        assert!(self.difficulty_window >= 2);
        let mut timestamps = timestamps.to_vec();
        let mut cumulative_difficulties = cumulative_difficulties.to_vec();
        let original_timestamps = timestamps.clone();
        let original_difficulties = cumulative_difficulties.clone();

        if timestamps.len() > self.difficulty_window {
            timestamps.truncate(self.difficulty_window);
            cumulative_difficulties.truncate(self.difficulty_window);
        }
        let length = timestamps.len();
        if length <= 1 {
            return 1;
        }
        timestamps.sort_unstable();

        let (span, total_work) = match trimmed_span_and_work(
            &timestamps,
            &cumulative_difficulties,
            self.difficulty_window,
            self.difficulty_cut,
        ) {
            Some(pair) => pair,
            None => return 0,
        };

        let product = u128::from(total_work) * u128::from(self.difficulty_target);
        if product >> 64 != 0 || u64::MAX - (product as u64) < u64::from(span) - 1 {
            return 0;
        }
        let low = product as u64;

        if block_index >= self.hardfork_v1_height {
            // Correction: recompute over the untrimmed tail of 17 blocks and
            // floor the result at 100.
            let window = 17usize.min(original_timestamps.len());
            let mut tail: Vec<Timestamp> =
                original_timestamps[original_timestamps.len() - window..].to_vec();
            let tail_difficulties =
                &original_difficulties[original_difficulties.len() - window..];
            if tail.len() <= 1 {
                return 1;
            }
            tail.sort_unstable();

            let (span, total_work) =
                match trimmed_span_and_work(&tail, tail_difficulties, 17, 0) {
                    Some(pair) => pair,
                    None => return 0,
                };
            let product = u128::from(total_work) * u128::from(self.difficulty_target);
            if product >> 64 != 0 || u64::MAX - (product as u64) < u64::from(span) - 1 {
                return 0;
            }
            let next = (product as u64) / u64::from(span);
            return next.max(100);
        }

        (low + u64::from(span) - 1) / u64::from(span)
    }

    /// Weighted average over the last `difficulty_window_v2` solve times,
    /// clamped to [-FTL, 6 * target], with a 10% bump when the last three
    /// blocks came in faster than 0.8 of a target interval.
    fn next_difficulty_v2(
        &self,
        timestamps: &[Timestamp],
        cumulative_difficulties: &[CumulativeDifficulty],
    ) -> Difficulty {
        let t = i128::from(self.difficulty_target);
        let n = self.difficulty_window_v2 as usize;
        let ftl = i128::from(self.block_future_time_limit_v2);

        if timestamps.len() <= n {
            return 1000;
        }

        let mut weighted_sum: i128 = 0;
        let mut last_3_span: i128 = 0;
        for i in 1..=n {
            let solve_time = i128::from(timestamps[i]) - i128::from(timestamps[i - 1]);
            let solve_time = solve_time.clamp(-ftl, 6 * t);
            weighted_sum += solve_time * i as i128;
            if i > n - 3 {
                last_3_span += solve_time;
            }
        }
        if weighted_sum <= 0 {
            weighted_sum = 1;
        }

        let window_work =
            (cumulative_difficulties[n] - cumulative_difficulties[0]) as i128;
        let mut next =
            window_work * t * (n as i128 + 1) * 99 / (100 * 2 * weighted_sum);
        let prev = (cumulative_difficulties[n] - cumulative_difficulties[n - 1]) as i128;

        if last_3_span < (8 * t) / 10 {
            next = (prev * 110) / 100;
        }
        if next < 0 {
            return 0;
        }
        next as Difficulty
    }
}

/// Time span and cumulative work of the window after trimming `cut`
/// outliers from each side. `None` when the work product would be invalid.
fn trimmed_span_and_work(
    sorted_timestamps: &[Timestamp],
    cumulative_difficulties: &[CumulativeDifficulty],
    window: usize,
    cut: usize,
) -> Option<(Timestamp, Difficulty)> {
    let length = sorted_timestamps.len();
    assert!(2 * cut <= window - 2);
    let (cut_begin, cut_end) = if length <= window - 2 * cut {
        (0, length)
    } else {
        let begin = (length - (window - 2 * cut) + 1) / 2;
        (begin, begin + (window - 2 * cut))
    };
    assert!(cut_begin + 2 <= cut_end && cut_end <= length);
    let mut span = sorted_timestamps[cut_end - 1] - sorted_timestamps[cut_begin];
    if span == 0 {
        span = 1;
    }
    let total_work = cumulative_difficulties[cut_end - 1] - cumulative_difficulties[cut_begin];
    assert!(total_work > 0);
    if total_work > u128::from(u64::MAX) {
        return None;
    }
    Some((span, total_work as Difficulty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use crate::params;

    fn mainnet() -> Currency {
        Currency::new(false)
    }

    /// Chain of `count` blocks with fixed spacing and difficulty 1 each.
    fn uniform_chain(count: usize, spacing: Timestamp) -> (Vec<Timestamp>, Vec<CumulativeDifficulty>) {
        let timestamps: Vec<Timestamp> = (0..count).map(|i| i as Timestamp * spacing).collect();
        let difficulties: Vec<CumulativeDifficulty> = (1..=count as u128).collect();
        (timestamps, difficulties)
    }

    // ============ Classic Algorithm Tests ============

    #[test]
    fn test_v1_empty_history_gives_one() {
        let currency = mainnet();
        assert_eq!(currency.next_difficulty(0, &[], &[]), 1);
        assert_eq!(currency.next_difficulty(1, &[0], &[1]), 1);
    }

    #[test]
    fn test_v1_on_target_spacing_holds_difficulty() {
        let currency = mainnet();
        let (timestamps, difficulties) = uniform_chain(10, params::DIFFICULTY_TARGET);
        let next = currency.next_difficulty(10, &timestamps, &difficulties);
        assert_eq!(next, 1);
    }

    #[test]
    fn test_v1_fast_blocks_raise_difficulty() {
        let currency = mainnet();
        // Blocks at a tenth of the target interval.
        let (timestamps, difficulties) = uniform_chain(50, params::DIFFICULTY_TARGET / 10);
        let next = currency.next_difficulty(50, &timestamps, &difficulties);
        assert!(next > 1, "next={}", next);
    }

    #[test]
    fn test_v1_zero_span_does_not_divide_by_zero() {
        let currency = mainnet();
        let timestamps = vec![100; 5];
        let difficulties: Vec<CumulativeDifficulty> = (1..=5).collect();
        let next = currency.next_difficulty(5, &timestamps, &difficulties);
        assert!(next > 0);
    }

    #[test]
    fn test_v1_correction_floors_at_100() {
        let currency = mainnet();
        // Past the first hard fork, slow blocks cannot push the result
        // under the floor of 100.
        let (timestamps, difficulties) =
            uniform_chain(30, params::DIFFICULTY_TARGET * 50);
        let next = currency.next_difficulty(
            params::HARDFORK_V1_HEIGHT,
            &timestamps,
            &difficulties,
        );
        assert_eq!(next, 100);
    }

    #[test]
    fn test_v1_overflow_returns_zero() {
        let currency = mainnet();
        // A window holding more than u64::MAX of work overflows the
        // work-times-target product.
        let timestamps = vec![0, 120, 240];
        let difficulties = vec![1u128, 1u128 << 90, 1u128 << 91];
        assert_eq!(currency.next_difficulty(100, &timestamps, &difficulties), 0);
    }

    // ============ Weighted Algorithm Tests ============

    #[test]
    fn test_v2_short_history_returns_1000() {
        let currency = mainnet();
        // Fewer than window + 1 blocks right after the fork.
        let (timestamps, difficulties) = uniform_chain(40, params::DIFFICULTY_TARGET);
        let next = currency.next_difficulty(
            params::HARDFORK_V2_HEIGHT + 1,
            &timestamps,
            &difficulties,
        );
        assert_eq!(next, 1000);
    }

    #[test]
    fn test_v2_on_target_spacing_is_stable() {
        let currency = mainnet();
        let count = params::DIFFICULTY_BLOCKS_COUNT_V2 as usize;
        let timestamps: Vec<Timestamp> =
            (0..count).map(|i| i as Timestamp * params::DIFFICULTY_TARGET).collect();
        // Constant difficulty of 1000 per block.
        let difficulties: Vec<CumulativeDifficulty> =
            (1..=count as u128).map(|i| i * 1000).collect();
        let next = currency.next_difficulty(
            params::HARDFORK_V2_HEIGHT + 100,
            &timestamps,
            &difficulties,
        );
        // The 99/100 damping keeps the result within a percent of steady state.
        assert!((980..=1000).contains(&next), "next={}", next);
    }

    #[test]
    fn test_v2_burst_bumps_ten_percent() {
        let currency = mainnet();
        let count = params::DIFFICULTY_BLOCKS_COUNT_V2 as usize;
        // Last three blocks mined nearly instantly.
        let mut timestamps: Vec<Timestamp> =
            (0..count).map(|i| i as Timestamp * params::DIFFICULTY_TARGET).collect();
        let base = timestamps[count - 4];
        timestamps[count - 3] = base + 1;
        timestamps[count - 2] = base + 2;
        timestamps[count - 1] = base + 3;
        let difficulties: Vec<CumulativeDifficulty> =
            (1..=count as u128).map(|i| i * 1000).collect();
        let next = currency.next_difficulty(
            params::HARDFORK_V2_HEIGHT + 100,
            &timestamps,
            &difficulties,
        );
        assert_eq!(next, 1100);
    }

    #[test]
    fn test_algorithm_selection_at_fork() {
        let currency = mainnet();
        let (timestamps, difficulties) = uniform_chain(10, params::DIFFICULTY_TARGET);
        // At the fork height the classic algorithm still runs (result 100+
        // floor from the correction); one block later the weighted one does
        // (short history, 1000).
        let at_fork =
            currency.next_difficulty(params::HARDFORK_V2_HEIGHT, &timestamps, &difficulties);
        let after_fork =
            currency.next_difficulty(params::HARDFORK_V2_HEIGHT + 1, &timestamps, &difficulties);
        assert_eq!(at_fork, 100);
        assert_eq!(after_fork, 1000);
    }
}
