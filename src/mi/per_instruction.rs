//! Mutual information between testcase identity and each individual
//! instruction's behavior.
//!
//! For each distinct instruction (`instr_image_id`, `instr_relative_addr`)
//! that participates in a memory access or stack allocation, `Y` is an
//! MD5-chained hash of the ordered sequence of encoded offsets that one
//! preprocessed run produced at that instruction — one `Y` per run, not
//! one per access. `I` is computed independently per instruction over the
//! resulting `(original_testcase_id, Y)` samples, using the same
//! replication-aware formula as the other analyzers. An instruction
//! touched by only one distinct testcase identity is omitted rather than
//! reported with a degenerate single-bucket `I = 0`.

use md5::Context;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::encoder::encode;
use crate::entry::{PreprocessedEntry, Trace};

use super::MutualInformation;

pub type InstructionKey = (u32, u64);

pub struct PerInstructionMi {
    /// Sorted descending by `bits`: the most leaky instructions first.
    pub by_instruction: Vec<(InstructionKey, MutualInformation)>,
}

fn instruction_key(entry: &PreprocessedEntry) -> Option<InstructionKey> {
    match *entry {
        PreprocessedEntry::StackAlloc {
            instr_image_id,
            instr_relative_addr,
            ..
        }
        | PreprocessedEntry::ImageMemoryAccess {
            instr_image_id,
            instr_relative_addr,
            ..
        }
        | PreprocessedEntry::HeapMemoryAccess {
            instr_image_id,
            instr_relative_addr,
            ..
        }
        | PreprocessedEntry::StackMemoryAccess {
            instr_image_id,
            instr_relative_addr,
            ..
        } => Some((instr_image_id, instr_relative_addr)),
        PreprocessedEntry::HeapAlloc { .. }
        | PreprocessedEntry::HeapFree { .. }
        | PreprocessedEntry::Branch { .. } => None,
    }
}

/// Chains the encoded values observed at one instruction, in order, into a
/// single 64-bit `Y`, the same way [`crate::mi::whole_trace::digest_trace`]
/// chains a whole trace.
fn hash_sequence(values: &[u64]) -> u64 {
    let mut ctx = Context::new();
    for v in values {
        ctx.consume(v.to_le_bytes());
    }
    let digest = ctx.compute().0;
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// Computes per-instruction `I` over `(original_testcase_id, trace)` pairs
/// — one pair per preprocessed run, including every replicate run a
/// `randomization_multiplier > 1` produces for the same original testcase.
pub fn compute(
    traces: &[(u64, &Trace)],
    granularity: u32,
    randomization_multiplier: u32,
) -> PerInstructionMi {
    let mut groups: FxHashMap<InstructionKey, Vec<(u64, u64)>> = FxHashMap::default();
    for (testcase_id, trace) in traces {
        let mut per_run: FxHashMap<InstructionKey, Vec<u64>> = FxHashMap::default();
        for entry in &trace.entries {
            if let Some(key) = instruction_key(entry) {
                per_run
                    .entry(key)
                    .or_default()
                    .push(encode(entry, granularity));
            }
        }
        for (key, values) in per_run {
            groups
                .entry(key)
                .or_default()
                .push((*testcase_id, hash_sequence(&values)));
        }
    }

    let mut by_instruction: Vec<(InstructionKey, MutualInformation)> = groups
        .into_iter()
        .filter(|(_, samples)| {
            samples
                .iter()
                .map(|(testcase_id, _)| testcase_id)
                .collect::<FxHashSet<_>>()
                .len()
                > 1
        })
        .map(|(key, samples)| {
            (
                key,
                MutualInformation::compute(samples, randomization_multiplier),
            )
        })
        .collect();

    by_instruction.sort_by(|a, b| {
        b.1.bits
            .partial_cmp(&a.1.bits)
            .expect("mutual information bits is never NaN")
    });
    PerInstructionMi { by_instruction }
}
