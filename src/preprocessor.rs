//! Preprocessor.
//!
//! Converts raw trace records plus the image map into address-normalized
//! [`PreprocessedEntry`] values. Runs once, with `prefix: None`, over the
//! trace's common prefix, and once per testcase against the resulting
//! [`TracePrefix`]. Fail-soft throughout: every unresolvable record is
//! logged via `log::warn!` and skipped rather than aborting the trace,
//! mirroring `samply`'s handling of unparsable perf records
//! (`samply/src/import/perf.rs` simply `continue`s past them).

use std::io::Write;
use std::sync::Arc;

use crate::alloc_tracker::{AllocationTracker, HeapAllocation};
use crate::entry::{write_prefix_header, PreprocessedEntry, Trace, TracePrefix};
use crate::error::Result;
use crate::image_map::ImageMap;
use crate::record::{RawRecord, RawTraceFile, RecordType};
use crate::stack_tracker::StackFrameTracker;

/// Per-file count of dropped (fail-soft-skipped) records, bucketed by
/// error kind. Gives callers a final per-file count of dropped records
/// without needing to scrape log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DroppedRecordCounts {
    pub unresolvable_address: u64,
    pub allocation_anomaly: u64,
    pub stack_frame_miss: u64,
    pub other: u64,
}

impl DroppedRecordCounts {
    pub fn total(&self) -> u64 {
        self.unresolvable_address + self.allocation_anomaly + self.stack_frame_miss + self.other
    }
}

/// Owns its `ImageMap` outright rather than borrowing it: the prefix run
/// needs to hand that map straight back out (inside the finished
/// `TracePrefix`), and a testcase run clones it from the prefix it was
/// built from. Either way there's no reference whose lifetime would need
/// to outlive the borrow of `self` in `finish_prefix`/`finish_testcase`.
pub struct Preprocessor {
    images: ImageMap,
    prefix: Option<Arc<TracePrefix>>,
    heap: AllocationTracker,
    stack: StackFrameTracker,
    sp_min: u64,
    sp_max: u64,
    next_heap_id: u32,
    size_stack: Vec<u64>,
    saw_size_since_last_alloc: bool,
    last_alloc_return_address: Option<u64>,
    dropped: DroppedRecordCounts,
    entries: Vec<PreprocessedEntry>,
}

impl Preprocessor {
    pub fn for_prefix(images: ImageMap) -> Self {
        Self {
            images,
            prefix: None,
            heap: AllocationTracker::new(),
            stack: StackFrameTracker::new(0),
            sp_min: 0,
            sp_max: 0,
            next_heap_id: 0,
            size_stack: Vec::new(),
            saw_size_since_last_alloc: false,
            last_alloc_return_address: None,
            dropped: DroppedRecordCounts::default(),
            entries: Vec::new(),
        }
    }

    /// `next_heap_id`/`next_stack_id` are treated as "count assigned so
    /// far", i.e. the next id to hand out — this is the cleanest
    /// underflow-safe way to carry the prefix's counters into a testcase
    /// run with zero prior allocations (see DESIGN.md).
    pub fn for_testcase(prefix: Arc<TracePrefix>) -> Self {
        let images = prefix.images.clone();
        Self {
            images,
            stack: StackFrameTracker::seed(prefix.initial_stack.clone(), prefix.last_stack_id),
            sp_min: prefix.sp_min,
            sp_max: prefix.sp_max,
            next_heap_id: prefix.last_heap_id,
            heap: AllocationTracker::new(),
            size_stack: Vec::new(),
            saw_size_since_last_alloc: false,
            last_alloc_return_address: None,
            dropped: DroppedRecordCounts::default(),
            entries: Vec::new(),
            prefix: Some(prefix),
        }
    }

    fn is_prefix(&self) -> bool {
        self.prefix.is_none()
    }

    fn emit<W: Write>(&mut self, entry: PreprocessedEntry, writer: &mut W) -> Result<()> {
        entry.write_to(writer)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Writes the image-table header. Only meaningful (and only ever
    /// called) for the prefix file; testcase files carry no header.
    pub fn write_header<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_prefix_header(writer, &self.images)?;
        Ok(())
    }

    pub fn process_file<W: Write>(&mut self, raw: &RawTraceFile, writer: &mut W) -> Result<()> {
        for record in raw.records() {
            self.process_record(record, writer)?;
        }
        Ok(())
    }

    fn process_record<W: Write>(&mut self, record: RawRecord, writer: &mut W) -> Result<()> {
        match record.ty {
            RecordType::HeapAllocSizeParameter => {
                self.size_stack.push(record.p1);
                self.saw_size_since_last_alloc = true;
            }
            RecordType::HeapAllocAddressReturn => {
                self.handle_heap_alloc_return(record, writer)?;
            }
            RecordType::HeapFreeAddressParameter => {
                self.handle_heap_free(record, writer)?;
            }
            RecordType::StackPointerInfo => {
                self.sp_min = record.p1;
                self.sp_max = record.p2;
            }
            RecordType::StackPointerModification => {
                self.handle_stack_pointer_modification(record, writer)?;
            }
            RecordType::Branch => {
                if !self.is_prefix() {
                    self.handle_branch(record, writer)?;
                }
            }
            RecordType::MemoryRead | RecordType::MemoryWrite => {
                if !self.is_prefix() {
                    self.handle_memory_access(record, writer)?;
                }
            }
        }
        Ok(())
    }

    fn handle_heap_alloc_return<W: Write>(
        &mut self,
        record: RawRecord,
        writer: &mut W,
    ) -> Result<()> {
        let is_duplicate_return = self.last_alloc_return_address == Some(record.p2)
            && !self.saw_size_since_last_alloc;
        if !is_duplicate_return {
            match self.size_stack.pop() {
                None => {
                    self.dropped.allocation_anomaly += 1;
                    log::warn!(
                        "heap alloc size-stack underflow at address return 0x{:x}",
                        record.p2
                    );
                }
                Some(size) => {
                    let id = self.next_heap_id;
                    self.next_heap_id += 1;
                    self.heap.insert(HeapAllocation {
                        id,
                        base: record.p2,
                        size,
                    });
                    self.emit(
                        PreprocessedEntry::HeapAlloc {
                            id,
                            size,
                            address: record.p2,
                        },
                        writer,
                    )?;
                }
            }
        }
        self.last_alloc_return_address = Some(record.p2);
        self.saw_size_since_last_alloc = false;
        Ok(())
    }

    fn handle_heap_free<W: Write>(&mut self, record: RawRecord, writer: &mut W) -> Result<()> {
        if record.p2 == 0 {
            return Ok(());
        }
        match self.heap.remove(record.p2) {
            None => {
                self.dropped.allocation_anomaly += 1;
                log::warn!("free of unknown heap address 0x{:x}", record.p2);
            }
            Some(alloc) => {
                self.emit(PreprocessedEntry::HeapFree { id: alloc.id }, writer)?;
            }
        }
        Ok(())
    }

    fn handle_stack_pointer_modification<W: Write>(
        &mut self,
        record: RawRecord,
        writer: &mut W,
    ) -> Result<()> {
        let Some(new_frame) = self.stack.apply_modification(record.p2, self.sp_max) else {
            return Ok(());
        };
        match self.images.find(record.p1) {
            None => {
                self.dropped.unresolvable_address += 1;
                log::warn!(
                    "unresolved instruction address 0x{:x} for stack allocation",
                    record.p1
                );
            }
            Some((instr_image_id, instr_relative_addr)) => {
                self.emit(
                    PreprocessedEntry::StackAlloc {
                        id: new_frame.id,
                        instr_image_id,
                        instr_relative_addr,
                        size: new_frame.size,
                        address: new_frame.base,
                    },
                    writer,
                )?;
            }
        }
        Ok(())
    }

    fn handle_branch<W: Write>(&mut self, record: RawRecord, writer: &mut W) -> Result<()> {
        let Some((source_image_id, source_relative_addr)) = self.images.find(record.p1) else {
            self.dropped.unresolvable_address += 1;
            log::warn!("unresolved branch source address 0x{:x}", record.p1);
            return Ok(());
        };
        let Some((dest_image_id, dest_relative_addr)) = self.images.find(record.p2) else {
            self.dropped.unresolvable_address += 1;
            log::warn!("unresolved branch dest address 0x{:x}", record.p2);
            return Ok(());
        };
        let source_interesting = self
            .images
            .image_by_id(source_image_id)
            .is_some_and(|i| i.interesting);
        let dest_interesting = self
            .images
            .image_by_id(dest_image_id)
            .is_some_and(|i| i.interesting);
        if !source_interesting && !dest_interesting {
            return Ok(());
        }
        let Some(kind) = record.branch_kind() else {
            self.dropped.other += 1;
            log::warn!(
                "branch record with unrecognized kind bits (flag=0x{:x})",
                record.flag
            );
            return Ok(());
        };
        self.emit(
            PreprocessedEntry::Branch {
                source_image_id,
                source_relative_addr,
                dest_image_id,
                dest_relative_addr,
                taken: record.branch_taken(),
                kind,
            },
            writer,
        )
    }

    fn handle_memory_access<W: Write>(&mut self, record: RawRecord, writer: &mut W) -> Result<()> {
        let is_write = record.ty == RecordType::MemoryWrite;
        let Some((instr_image_id, instr_relative_addr)) = self.images.find(record.p1) else {
            return Ok(());
        };
        let instr_interesting = self
            .images
            .image_by_id(instr_image_id)
            .is_some_and(|i| i.interesting);
        if !instr_interesting {
            return Ok(());
        }

        let addr = record.p2;
        if self.sp_min <= addr && addr <= self.sp_max {
            match self.stack.find_containing(addr) {
                None => {
                    self.dropped.stack_frame_miss += 1;
                    log::warn!("stack address 0x{:x} maps to no live frame", addr);
                }
                Some(frame) => {
                    self.emit(
                        PreprocessedEntry::StackMemoryAccess {
                            is_write,
                            size: record.size0,
                            instr_image_id,
                            instr_relative_addr,
                            stack_id: frame.id,
                            relative_addr: addr - frame.base,
                        },
                        writer,
                    )?;
                }
            }
            return Ok(());
        }

        if let Some((mem_image_id, mem_relative_addr)) = self.images.find(addr) {
            self.emit(
                PreprocessedEntry::ImageMemoryAccess {
                    is_write,
                    size: record.size0,
                    instr_image_id,
                    instr_relative_addr,
                    mem_image_id,
                    mem_relative_addr,
                },
                writer,
            )?;
            return Ok(());
        }

        let alloc = self
            .heap
            .find_containing(addr)
            .or_else(|| {
                self.prefix
                    .as_ref()
                    .and_then(|p| p.initial_heap.find_containing(addr))
            })
            .copied();
        match alloc {
            None => {
                self.dropped.unresolvable_address += 1;
                log::warn!(
                    "memory address 0x{:x} resolves to no image, heap, or stack",
                    addr
                );
            }
            Some(alloc) => {
                let relative_addr = addr - alloc.base;
                let heap_id = alloc.id;
                self.emit(
                    PreprocessedEntry::HeapMemoryAccess {
                        is_write,
                        size: record.size0,
                        instr_image_id,
                        instr_relative_addr,
                        heap_id,
                        relative_addr,
                    },
                    writer,
                )?;
            }
        }
        Ok(())
    }

    pub fn dropped(&self) -> DroppedRecordCounts {
        self.dropped
    }

    /// Finalizes a prefix run into the shared, immutable [`TracePrefix`].
    pub fn finish_prefix(self) -> (Arc<TracePrefix>, DroppedRecordCounts) {
        let prefix = TracePrefix {
            images: self.images,
            initial_heap: self.heap,
            initial_stack: self.stack.frames().to_vec(),
            last_heap_id: self.next_heap_id,
            last_stack_id: self.stack.next_id(),
            sp_min: self.sp_min,
            sp_max: self.sp_max,
        };
        (Arc::new(prefix), self.dropped)
    }

    /// Finalizes a testcase run into a [`Trace`] referencing its shared
    /// prefix.
    pub fn finish_testcase(self) -> (Trace, DroppedRecordCounts) {
        let trace = Trace {
            prefix: self.prefix.expect("finish_testcase called on a prefix run"),
            entries: self.entries,
            heap: self.heap,
        };
        (trace, self.dropped)
    }
}
