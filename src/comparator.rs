//! Pairwise trace comparator.
//!
//! Walks two preprocessed traces in lock-step and reports the first point
//! where they diverge. Heap and stack ids are assigned independently by
//! each trace's preprocessor run, so the comparator builds its own
//! id-in-1 -> id-in-2 mapping as matching `HeapAlloc`/`StackAlloc` entries
//! are encountered, the same insert-if-absent-else-reuse shape
//! `ThreadStringTable::index_for_global_string` uses to map a profile's
//! global string indices onto each thread's local ones
//! (`fxprof-processed-profile/src/thread_string_table.rs`).

use rustc_hash::FxHashMap;

use crate::entry::{PreprocessedEntry, Trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    DifferentType,
    DifferentBranchTarget,
    BranchTakenIn1,
    BranchTakenIn2,
    DifferentAllocationSize,
    FreedBlockNotMatching,
    DifferentImageMemoryReadOffset,
    DifferentImageMemoryWriteOffset,
    DifferentHeapMemoryReadOffset,
    DifferentHeapMemoryWriteOffset,
    DifferentStackMemoryReadOffset,
    DifferentStackMemoryWriteOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOutcome {
    Match,
    Diverge { index: usize, class: Divergence },
}

impl ComparisonOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// Masks an address down to its containing `granularity`-sized bucket.
/// `granularity` is required to be a power of two (validated by
/// `PipelineConfig`); granularity 1 is a no-op mask.
fn mask(addr: u64, granularity: u32) -> u64 {
    addr & !(granularity as u64 - 1)
}

struct IdMapper {
    heap: FxHashMap<u32, u32>,
    stack: FxHashMap<u32, u32>,
}

impl IdMapper {
    fn new() -> Self {
        Self {
            heap: FxHashMap::default(),
            stack: FxHashMap::default(),
        }
    }
}

/// Compares two preprocessed traces under the given byte `granularity`.
/// Satisfies `compare(t, t) == Match` for any `t`: every branch compares
/// equal values against themselves, and every id mapping is the identity
/// when both sides are literally the same trace.
pub fn compare(a: &Trace, b: &Trace, granularity: u32) -> ComparisonOutcome {
    let mut ids = IdMapper::new();
    let len = a.entries.len().max(b.entries.len());
    for i in 0..len {
        match (a.entries.get(i), b.entries.get(i)) {
            (Some(x), Some(y)) => {
                if let Some(class) = diverge(x, y, &mut ids, granularity) {
                    return ComparisonOutcome::Diverge { index: i, class };
                }
            }
            _ => {
                return ComparisonOutcome::Diverge {
                    index: i,
                    class: Divergence::DifferentType,
                }
            }
        }
    }
    ComparisonOutcome::Match
}

fn diverge(
    a: &PreprocessedEntry,
    b: &PreprocessedEntry,
    ids: &mut IdMapper,
    granularity: u32,
) -> Option<Divergence> {
    use PreprocessedEntry::*;
    match (a, b) {
        (
            HeapAlloc {
                id: id_a,
                size: size_a,
                ..
            },
            HeapAlloc {
                id: id_b,
                size: size_b,
                ..
            },
        ) => {
            if size_a != size_b {
                return Some(Divergence::DifferentAllocationSize);
            }
            ids.heap.insert(*id_a, *id_b);
            None
        }
        (HeapFree { id: id_a }, HeapFree { id: id_b }) => {
            if ids.heap.get(id_a) == Some(id_b) {
                None
            } else {
                Some(Divergence::FreedBlockNotMatching)
            }
        }
        (
            StackAlloc {
                id: id_a,
                size: size_a,
                ..
            },
            StackAlloc {
                id: id_b,
                size: size_b,
                ..
            },
        ) => {
            if size_a != size_b {
                return Some(Divergence::DifferentAllocationSize);
            }
            ids.stack.insert(*id_a, *id_b);
            None
        }
        (
            Branch {
                dest_image_id: dest_a,
                dest_relative_addr: raddr_a,
                taken: taken_a,
                kind: kind_a,
                ..
            },
            Branch {
                dest_image_id: dest_b,
                dest_relative_addr: raddr_b,
                taken: taken_b,
                kind: kind_b,
                ..
            },
        ) => {
            if taken_a != taken_b {
                return Some(if *taken_a {
                    Divergence::BranchTakenIn1
                } else {
                    Divergence::BranchTakenIn2
                });
            }
            // Branch targets are code addresses, not maskable data
            // addresses: compared exactly regardless of granularity.
            if *kind_a != *kind_b || dest_a != dest_b || raddr_a != raddr_b {
                return Some(Divergence::DifferentBranchTarget);
            }
            None
        }
        (
            ImageMemoryAccess {
                is_write: write_a,
                mem_image_id: img_a,
                mem_relative_addr: raddr_a,
                ..
            },
            ImageMemoryAccess {
                is_write: write_b,
                mem_image_id: img_b,
                mem_relative_addr: raddr_b,
                ..
            },
        ) => {
            if write_a != write_b {
                return Some(Divergence::DifferentType);
            }
            if img_a != img_b || mask(*raddr_a, granularity) != mask(*raddr_b, granularity) {
                return Some(if *write_a {
                    Divergence::DifferentImageMemoryWriteOffset
                } else {
                    Divergence::DifferentImageMemoryReadOffset
                });
            }
            None
        }
        (
            HeapMemoryAccess {
                is_write: write_a,
                heap_id: heap_a,
                relative_addr: raddr_a,
                ..
            },
            HeapMemoryAccess {
                is_write: write_b,
                heap_id: heap_b,
                relative_addr: raddr_b,
                ..
            },
        ) => {
            if write_a != write_b {
                return Some(Divergence::DifferentType);
            }
            let mapped = ids.heap.get(heap_a);
            if mapped != Some(heap_b) || mask(*raddr_a, granularity) != mask(*raddr_b, granularity)
            {
                return Some(if *write_a {
                    Divergence::DifferentHeapMemoryWriteOffset
                } else {
                    Divergence::DifferentHeapMemoryReadOffset
                });
            }
            None
        }
        (
            StackMemoryAccess {
                is_write: write_a,
                stack_id: stack_a,
                relative_addr: raddr_a,
                ..
            },
            StackMemoryAccess {
                is_write: write_b,
                stack_id: stack_b,
                relative_addr: raddr_b,
                ..
            },
        ) => {
            if write_a != write_b {
                return Some(Divergence::DifferentType);
            }
            let mapped = ids.stack.get(stack_a);
            if mapped != Some(stack_b) || mask(*raddr_a, granularity) != mask(*raddr_b, granularity)
            {
                return Some(if *write_a {
                    Divergence::DifferentStackMemoryWriteOffset
                } else {
                    Divergence::DifferentStackMemoryReadOffset
                });
            }
            None
        }
        _ => Some(Divergence::DifferentType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc_tracker::AllocationTracker;
    use crate::entry::TracePrefix;
    use crate::record::BranchKind;
    use std::sync::Arc;

    fn prefix() -> Arc<TracePrefix> {
        Arc::new(TracePrefix {
            images: crate::image_map::ImageMap::default(),
            initial_heap: AllocationTracker::new(),
            initial_stack: Vec::new(),
            last_heap_id: 0,
            last_stack_id: 0,
            sp_min: 0,
            sp_max: 0,
        })
    }

    fn trace(entries: Vec<PreprocessedEntry>) -> Trace {
        Trace {
            prefix: prefix(),
            entries,
            heap: AllocationTracker::new(),
        }
    }

    #[test]
    fn identical_traces_match() {
        let t = trace(vec![PreprocessedEntry::Branch {
            source_image_id: 0,
            source_relative_addr: 0x10,
            dest_image_id: 0,
            dest_relative_addr: 0x20,
            taken: true,
            kind: BranchKind::Jump,
        }]);
        assert!(compare(&t, &t, 1).is_match());
    }

    #[test]
    fn branch_taken_in_one_side_diverges() {
        let make = |taken| {
            trace(vec![PreprocessedEntry::Branch {
                source_image_id: 0,
                source_relative_addr: 0x10,
                dest_image_id: 0,
                dest_relative_addr: 0x20,
                taken,
                kind: BranchKind::Jump,
            }])
        };
        let outcome = compare(&make(true), &make(false), 1);
        assert_eq!(
            outcome,
            ComparisonOutcome::Diverge {
                index: 0,
                class: Divergence::BranchTakenIn1
            }
        );
    }

    #[test]
    fn heap_alloc_ids_are_mapped_before_free_is_checked() {
        let t1 = trace(vec![
            PreprocessedEntry::HeapAlloc {
                id: 5,
                size: 16,
                address: 0x800000,
            },
            PreprocessedEntry::HeapFree { id: 5 },
        ]);
        let t2 = trace(vec![
            PreprocessedEntry::HeapAlloc {
                id: 9,
                size: 16,
                address: 0x900000,
            },
            PreprocessedEntry::HeapFree { id: 9 },
        ]);
        assert!(compare(&t1, &t2, 1).is_match());
    }

    #[test]
    fn mismatched_free_is_reported() {
        let t1 = trace(vec![
            PreprocessedEntry::HeapAlloc {
                id: 5,
                size: 16,
                address: 0x800000,
            },
            PreprocessedEntry::HeapAlloc {
                id: 6,
                size: 16,
                address: 0x800100,
            },
            PreprocessedEntry::HeapFree { id: 5 },
        ]);
        let t2 = trace(vec![
            PreprocessedEntry::HeapAlloc {
                id: 9,
                size: 16,
                address: 0x900000,
            },
            PreprocessedEntry::HeapAlloc {
                id: 10,
                size: 16,
                address: 0x900100,
            },
            PreprocessedEntry::HeapFree { id: 10 },
        ]);
        let outcome = compare(&t1, &t2, 1);
        assert_eq!(
            outcome,
            ComparisonOutcome::Diverge {
                index: 2,
                class: Divergence::FreedBlockNotMatching
            }
        );
    }

    #[test]
    fn granularity_masks_small_offset_differences() {
        let make = |addr| {
            trace(vec![PreprocessedEntry::ImageMemoryAccess {
                is_write: false,
                size: 4,
                instr_image_id: 0,
                instr_relative_addr: 0x10,
                mem_image_id: 0,
                mem_relative_addr: addr,
            }])
        };
        // 0x100 and 0x104 fall in the same 64-byte bucket.
        assert!(compare(&make(0x100), &make(0x104), 64).is_match());
        assert!(!compare(&make(0x100), &make(0x140), 64).is_match());
    }

    #[test]
    fn trailing_entries_diverge_as_different_type() {
        let t1 = trace(vec![PreprocessedEntry::HeapFree { id: 0 }]);
        let t2 = trace(vec![]);
        let outcome = compare(&t1, &t2, 1);
        assert_eq!(
            outcome,
            ComparisonOutcome::Diverge {
                index: 0,
                class: Divergence::DifferentType
            }
        );
    }
}
