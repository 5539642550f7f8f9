//! Rounds per-step shapes to a bounded set of bucket sizes so the forward
//! pass sees a small, constant number of compiled shapes instead of one per
//! concrete step.

use runner_common::{Result, RunnerError};

#[derive(Debug, Clone)]
pub struct PaddingPolicy {
    token_paddings: Vec<usize>,
    max_num_seqs: usize,
}

impl PaddingPolicy {
    /// `padding_gap == 0` doubles from `min_token_size` up to `max_token_size`;
    /// otherwise doubles up to `padding_gap` and then adds constant-size gaps,
    /// mirroring `eSurgeRunner._get_token_paddings`.
    pub fn new(min_token_size: usize, max_token_size: usize, padding_gap: usize, max_num_seqs: usize) -> Self {
        assert!(min_token_size > 0 && (min_token_size & (min_token_size - 1)) == 0);
        let mut paddings = Vec::new();
        let mut num = min_token_size;
        if padding_gap == 0 {
            while num <= max_token_size {
                paddings.push(num);
                num *= 2;
            }
        } else {
            while num <= padding_gap {
                paddings.push(num);
                num *= 2;
            }
            num /= 2;
            while num < max_token_size {
                num += padding_gap;
                paddings.push(num);
            }
        }
        Self { token_paddings: paddings, max_num_seqs }
    }

    pub fn max_num_tokens(&self) -> usize {
        *self.token_paddings.last().expect("at least one padding bucket")
    }

    /// Smallest bucket >= `n`; fatal if `n` exceeds the largest bucket.
    pub fn pad_num_tokens(&self, n: usize) -> Result<usize> {
        self.token_paddings
            .iter()
            .copied()
            .find(|&bucket| bucket >= n)
            .ok_or_else(|| {
                RunnerError::CapacityExceeded(format!(
                    "token count {n} exceeds largest padding bucket {}",
                    self.token_paddings.last().copied().unwrap_or(0)
                ))
            })
    }

    /// `8` if `n <= 8`, else the next power of two, capped at `max_num_seqs`.
    pub fn pad_num_reqs(&self, n: usize) -> usize {
        let res = if n <= 8 { 8 } else { n.next_power_of_two() };
        res.min(self.max_num_seqs)
    }

    /// Rounds `min(2*max_reqs + num_tokens/page_size, num_tokens)` up to a
    /// multiple of `per_page`.
    pub fn pad_num_slices(&self, num_tokens: usize, max_reqs: usize, page_size: usize, per_page: usize) -> usize {
        let raw = std::cmp::min(2 * max_reqs + num_tokens / page_size, num_tokens);
        (raw + per_page - 1) / per_page * per_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_num_tokens_is_idempotent() {
        let policy = PaddingPolicy::new(16, 8192, 0, 8);
        for x in [1usize, 16, 17, 1000, 8192] {
            let once = policy.pad_num_tokens(x).unwrap();
            let twice = policy.pad_num_tokens(once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn pad_num_tokens_rejects_overflow() {
        let policy = PaddingPolicy::new(16, 8192, 0, 8);
        assert!(policy.pad_num_tokens(8193).is_err());
    }

    #[test]
    fn pad_num_reqs_follows_bucket_rule() {
        let policy = PaddingPolicy::new(16, 8192, 0, 64);
        assert_eq!(policy.pad_num_reqs(1), 8);
        assert_eq!(policy.pad_num_reqs(8), 8);
        assert_eq!(policy.pad_num_reqs(9), 16);
        assert_eq!(policy.pad_num_reqs(100), 64);
    }

    #[test]
    fn pad_num_reqs_is_idempotent() {
        let policy = PaddingPolicy::new(16, 8192, 0, 64);
        for x in [1usize, 8, 9, 17, 33, 100] {
            let once = policy.pad_num_reqs(x);
            let twice = policy.pad_num_reqs(once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn pad_num_slices_is_deterministic_and_page_aligned() {
        // pad_num_slices folds in max_reqs/page_size constants, so unlike
        // pad_num_tokens/pad_num_reqs it is not idempotent under self-feeding
        // (the per-page rounding of a smaller re-derived raw value can
        // undershoot the first result). What must hold: same inputs always
        // produce the same, per_page-aligned output.
        let policy = PaddingPolicy::new(16, 8192, 0, 8);
        for n in [1usize, 33, 128, 5000] {
            let once = policy.pad_num_slices(n, 8, 128, 8);
            let again = policy.pad_num_slices(n, 8, 128, 8);
            assert_eq!(once, again);
            assert_eq!(once % 8, 0);
        }
    }
}
