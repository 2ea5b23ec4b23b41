//! Output-file writers.
//!
//! Takes an injected `impl Write` rather than a `Path` throughout, so
//! callers (and tests) can target a file, a buffer, or an in-memory
//! `Vec<u8>` without the writer knowing the difference — the same shape
//! as `PreprocessedEntry::write_to`.

use std::io::{self, Write};

use crate::comparator::{ComparisonOutcome, Divergence};
use crate::encoder::encode;
use crate::entry::Trace;
use crate::mi::per_instruction::PerInstructionMi;
use crate::mi::prefix_length::PrefixLengthMi;
use crate::mi::MutualInformation;

fn divergence_file_stem(class: Divergence) -> &'static str {
    match class {
        Divergence::DifferentType => "different_type",
        Divergence::DifferentBranchTarget => "different_branch_target",
        Divergence::BranchTakenIn1 => "branch_taken_in_1",
        Divergence::BranchTakenIn2 => "branch_taken_in_2",
        Divergence::DifferentAllocationSize => "different_allocation_size",
        Divergence::FreedBlockNotMatching => "freed_block_not_matching",
        Divergence::DifferentImageMemoryReadOffset => "different_image_memory_read_offset",
        Divergence::DifferentImageMemoryWriteOffset => "different_image_memory_write_offset",
        Divergence::DifferentHeapMemoryReadOffset => "different_heap_memory_read_offset",
        Divergence::DifferentHeapMemoryWriteOffset => "different_heap_memory_write_offset",
        Divergence::DifferentStackMemoryReadOffset => "different_stack_memory_read_offset",
        Divergence::DifferentStackMemoryWriteOffset => "different_stack_memory_write_offset",
    }
}

/// File name for a mismatch report: `mismatch_{class}_{line}.txt`.
pub fn mismatch_file_name(class: Divergence, index: usize) -> String {
    format!("mismatch_{}_{}.txt", divergence_file_stem(class), index)
}

/// Writes a single comparison's mismatch report: the two testcase
/// identifiers and the two divergent entries, rendered as hex via their
/// encoded form. No-ops (writes nothing) on `Match`; callers are expected
/// to only call this once a `Diverge` outcome has already been matched
/// out.
pub fn write_mismatch_report<W: Write>(
    w: &mut W,
    testcase_a: &str,
    testcase_b: &str,
    a: &Trace,
    b: &Trace,
    outcome: ComparisonOutcome,
) -> io::Result<()> {
    let ComparisonOutcome::Diverge { index, class } = outcome else {
        return Ok(());
    };
    writeln!(w, "divergence: {}", divergence_file_stem(class))?;
    writeln!(w, "entry index: {index}")?;
    writeln!(w, "testcase a: {testcase_a}")?;
    writeln!(w, "testcase b: {testcase_b}")?;
    if let Some(entry) = a.entries.get(index) {
        writeln!(w, "entry a: 0x{:016x}", encode(entry, 1))?;
    }
    if let Some(entry) = b.entries.get(index) {
        writeln!(w, "entry b: 0x{:016x}", encode(entry, 1))?;
    }
    Ok(())
}

/// Writes `mutual_information.txt`'s whole-trace line: `total_entries` is
/// the number of entries the digest was folded over.
pub fn write_whole_trace_mi<W: Write>(
    w: &mut W,
    mi: MutualInformation,
    total_entries: usize,
) -> io::Result<()> {
    writeln!(
        w,
        "Mutual information after {total_entries} entries: {:.3} bits",
        mi.bits
    )
}

/// Writes `mutual_information.txt`'s per-prefix-depth lines. `per_depth[i]`
/// reports the MI after `i + 1` entries.
pub fn write_prefix_length_mi<W: Write>(w: &mut W, mi: &PrefixLengthMi) -> io::Result<()> {
    for (depth, point) in mi.per_depth.iter().enumerate() {
        writeln!(
            w,
            "Mutual information after {} entries: {:.3} bits",
            depth + 1,
            point.bits
        )?;
    }
    Ok(())
}

/// Writes `mutual_information_instructions.txt`: one line per instruction,
/// most leaky first (the analyzer's own sort order).
pub fn write_per_instruction_mi<W: Write>(w: &mut W, mi: &PerInstructionMi) -> io::Result<()> {
    for ((image_id, relative_addr), point) in &mi.by_instruction {
        writeln!(
            w,
            "image={image_id} addr=0x{relative_addr:x} bits={:.6} buckets={} samples={}",
            point.bits, point.bucket_count, point.sample_count
        )?;
    }
    Ok(())
}
