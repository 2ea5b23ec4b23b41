//! Mutual information between testcase identity and a trace's full
//! content, treated as a single observation per run.
//!
//! Every testcase's entire preprocessed trace is folded into one MD5
//! digest by feeding each entry's [`crate::encoder::encode`] value into a
//! running hash, in order. Two testcases (or two replicate runs of the
//! same testcase) that hash equal are treated as the same observation;
//! the resulting `(testcase_id, digest)` samples feed the shared
//! [`MutualInformation::compute`] formula.

use md5::Context;

use crate::encoder::encode;
use crate::entry::Trace;

use super::MutualInformation;

pub fn digest_trace(trace: &Trace, granularity: u32) -> [u8; 16] {
    let mut ctx = Context::new();
    for entry in &trace.entries {
        ctx.consume(encode(entry, granularity).to_le_bytes());
    }
    ctx.compute().0
}

fn digest_to_u64(digest: [u8; 16]) -> u64 {
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// Computes `I` over `(testcase_id, digest)` pairs, one per preprocessed
/// testcase run (including replicate runs, if any).
pub fn compute(samples: impl IntoIterator<Item = (u64, [u8; 16])>, randomization_multiplier: u32) -> MutualInformation {
    MutualInformation::compute(
        samples.into_iter().map(|(x, d)| (x, digest_to_u64(d))),
        randomization_multiplier,
    )
}
