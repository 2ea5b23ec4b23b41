//! Mutual-information leakage analyzers.
//!
//! Three views over the same preprocessed testcases, all built on the
//! same MD5 hash-chaining primitive: the whole trace as one observation,
//! the trace truncated to each prefix length, and each interesting
//! instruction's memory/branch behavior in isolation. All three reduce to
//! the same general mutual-information formula once reduced to
//! `(testcase_id, observation)` samples.

pub mod hash_pool;
pub mod per_instruction;
pub mod prefix_length;
pub mod whole_trace;

pub use hash_pool::HashPool;

use rustc_hash::FxHashMap;

/// `I(X;Y) = Σ p(x,y) log2(p(x,y)/(p(x)p(y)))`, computed in bits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MutualInformation {
    pub bits: f64,
    pub bucket_count: usize,
    pub sample_count: usize,
}

impl MutualInformation {
    /// General computation over `(testcase_id, observation)` samples,
    /// supporting `randomization_multiplier`-fold duplicate runs per
    /// testcase, treating the inner count as a multiset frequency:
    /// `p(x,y) = c(x,y)/N`, `p(y) = Σ_x c(x,y)/N`, `p(x) = r/N`, with `N`
    /// the total sample count (testcases × replicates). Degenerate
    /// `r = 1` with one sample per testcase reduces to the plain
    /// per-bucket entropy formula.
    pub fn compute(
        samples: impl IntoIterator<Item = (u64, u64)>,
        randomization_multiplier: u32,
    ) -> Self {
        let r = randomization_multiplier.max(1) as f64;
        let mut count_xy: FxHashMap<(u64, u64), usize> = FxHashMap::default();
        let mut count_y: FxHashMap<u64, usize> = FxHashMap::default();
        let mut n = 0usize;
        for (x, y) in samples {
            *count_xy.entry((x, y)).or_insert(0) += 1;
            *count_y.entry(y).or_insert(0) += 1;
            n += 1;
        }
        let nf = n as f64;
        let mut bits = 0.0;
        if nf > 0.0 {
            for (&(_, y), &cxy) in &count_xy {
                let cxy = cxy as f64;
                let cy = count_y[&y] as f64;
                bits += (cxy / nf) * ((cxy * nf) / (r * cy)).log2();
            }
        }
        Self {
            bits,
            bucket_count: count_y.len(),
            sample_count: n,
        }
    }

    /// Special case of [`Self::compute`] for the common `r = 1`, one
    /// sample per testcase setting: `bucket_sizes` is the size of each
    /// distinct-observation bucket.
    pub fn from_bucket_sizes(sample_count: usize, bucket_sizes: impl Iterator<Item = usize>) -> Self {
        let n = sample_count as f64;
        let mut bits = 0.0;
        let mut bucket_count = 0;
        for size in bucket_sizes {
            if size == 0 {
                continue;
            }
            bucket_count += 1;
            if n > 0.0 {
                let p = size as f64 / n;
                bits += p * (n / size as f64).log2();
            }
        }
        Self {
            bits,
            bucket_count,
            sample_count,
        }
    }

    /// Flags results indistinguishable from the spread expected purely
    /// from `randomization_multiplier`-fold internal randomization: within
    /// 0.9 bits of `log2(sample_count / randomization_multiplier)`.
    pub fn is_under_sampled(&self, randomization_multiplier: u32) -> bool {
        if randomization_multiplier <= 1 || self.sample_count == 0 {
            return false;
        }
        let expected = (self.sample_count as f64 / randomization_multiplier as f64).log2();
        (self.bits - expected).abs() <= 0.9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bucket_containing_everything_has_zero_bits() {
        let mi = MutualInformation::from_bucket_sizes(10, std::iter::once(10));
        assert_eq!(mi.bits, 0.0);
    }

    #[test]
    fn every_sample_in_its_own_bucket_has_log2_n_bits() {
        let mi = MutualInformation::from_bucket_sizes(8, std::iter::repeat(1).take(8));
        assert!((mi.bits - 3.0).abs() < 1e-9);
    }

    #[test]
    fn single_testcase_is_zero_bits() {
        let mi = MutualInformation::from_bucket_sizes(1, std::iter::once(1));
        assert_eq!(mi.bits, 0.0);
    }

    #[test]
    fn compute_agrees_with_from_bucket_sizes_when_unreplicated() {
        // 4 testcases, each producing its own distinct observation.
        let samples = (0..4u64).map(|x| (x, x));
        let mi = MutualInformation::compute(samples, 1);
        assert!((mi.bits - 2.0).abs() < 1e-9);
    }

    #[test]
    fn replicated_testcases_with_identical_observations_are_zero_bits() {
        // 2 testcases, each replicated 3x, each replicate producing the
        // same observation regardless of testcase identity: no leak.
        let samples = (0..2u64).flat_map(|x| std::iter::repeat((x, 0u64)).take(3));
        let mi = MutualInformation::compute(samples, 3);
        assert!(mi.bits.abs() < 1e-9);
    }

    #[test]
    fn replicated_testcases_that_fully_leak_report_log2_n_unique() {
        // 4 testcases, replicated 2x, each replicate's observation equal
        // to its testcase id: full leak, independent of replication.
        let samples = (0..4u64).flat_map(|x| std::iter::repeat((x, x)).take(2));
        let mi = MutualInformation::compute(samples, 2);
        assert!((mi.bits - 2.0).abs() < 1e-9);
    }
}
