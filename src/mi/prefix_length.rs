//! Mutual information between testcase identity and a trace truncated to
//! each prefix length, swept over every depth.
//!
//! Reports `I` as a function of how many entries of each testcase's trace
//! are considered. Rather than re-hashing every prefix from scratch at
//! every depth (quadratic in trace length), the partition at depth `d` is
//! refined incrementally from the partition at depth `d-1`: two testcases
//! can only still be in the same bucket at depth `d` if they were in the
//! same bucket at depth `d-1` *and* their depth-`d` entries encode equal.
//! That keeps the whole sweep amortized linear in the total entry count.

use rustc_hash::FxHashMap;

use crate::encoder::encode;
use crate::entry::Trace;

use super::MutualInformation;

/// `per_depth[d]` is the mutual information considering only the first
/// `d + 1` entries of every trace. Traces shorter than `d + 1` entries
/// contribute a fixed sentinel value (0) in place of a missing hash, per
/// the short-trace convention in DESIGN.md.
pub struct PrefixLengthMi {
    pub per_depth: Vec<MutualInformation>,
}

/// `traces` carries each run's original testcase id alongside its trace, so
/// `randomization_multiplier`-fold replicate runs of the same testcase can
/// be told apart from distinct testcases when computing `I`.
pub fn compute(traces: &[(u64, &Trace)], granularity: u32, randomization_multiplier: u32) -> PrefixLengthMi {
    let n = traces.len();
    let max_len = traces.iter().map(|(_, t)| t.entries.len()).max().unwrap_or(0);
    let mut group_ids = vec![0u64; n];
    let mut per_depth = Vec::with_capacity(max_len);

    for depth in 0..max_len {
        let mut refine: FxHashMap<(u64, u64), u64> = FxHashMap::default();
        let mut next_id = 0u64;
        let mut new_ids = vec![0u64; n];
        for (i, (_, trace)) in traces.iter().enumerate() {
            let value = trace
                .entries
                .get(depth)
                .map(|e| encode(e, granularity))
                .unwrap_or(0);
            let key = (group_ids[i], value);
            let id = *refine.entry(key).or_insert_with(|| {
                let id = next_id;
                next_id += 1;
                id
            });
            new_ids[i] = id;
        }
        group_ids = new_ids;

        let samples = traces
            .iter()
            .zip(&group_ids)
            .map(|((testcase_id, _), group_id)| (*testcase_id, *group_id));
        per_depth.push(MutualInformation::compute(samples, randomization_multiplier));
    }

    PrefixLengthMi { per_depth }
}
