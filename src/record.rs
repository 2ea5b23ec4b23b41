//! Raw trace reader.
//!
//! The raw trace file is a packed array of fixed-size, 24-byte,
//! little-endian records with 1-byte struct packing:
//!
//! ```text
//! type:u32, flag:u8, pad:u8, size0:u16, p1:u64, p2:u64
//! ```
//!
//! We mmap the file (as `samply`'s linux/mac importers do for perf.data and
//! object files) and decode records field-by-field rather than
//! reinterpreting the mapped bytes as a `#[repr(C, packed)]` struct, so the
//! reader works the same on any host regardless of its native alignment
//! requirements.

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use crate::error::{Result, TraceWalkError};

pub const RECORD_SIZE: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    MemoryRead = 1,
    MemoryWrite = 2,
    HeapAllocSizeParameter = 3,
    HeapAllocAddressReturn = 4,
    HeapFreeAddressParameter = 5,
    Branch = 6,
    StackPointerInfo = 7,
    StackPointerModification = 8,
}

impl RecordType {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::MemoryRead,
            2 => Self::MemoryWrite,
            3 => Self::HeapAllocSizeParameter,
            4 => Self::HeapAllocAddressReturn,
            5 => Self::HeapFreeAddressParameter,
            6 => Self::Branch,
            7 => Self::StackPointerInfo,
            8 => Self::StackPointerModification,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Jump,
    Call,
    Return,
}

impl BranchKind {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            1 => Self::Jump,
            2 => Self::Call,
            3 => Self::Return,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPointerModKind {
    Call,
    Return,
    Other,
}

impl StackPointerModKind {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            1 => Self::Call,
            2 => Self::Return,
            3 => Self::Other,
            _ => return None,
        })
    }
}

/// One decoded 24-byte raw trace record.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord {
    pub ty: RecordType,
    pub flag: u8,
    pub size0: u16,
    pub p1: u64,
    pub p2: u64,
}

impl RawRecord {
    /// `taken` bit (bit 0 of `flag`), meaningful on `Branch` records only.
    pub fn branch_taken(&self) -> bool {
        self.flag & 1 != 0
    }

    /// Branch kind from bits 1-2 of `flag` (mask `3 << 1`).
    pub fn branch_kind(&self) -> Option<BranchKind> {
        BranchKind::from_bits((self.flag >> 1) & 0b11)
    }

    /// Stack-pointer-modification kind, from the low two bits of `flag`.
    pub fn stack_pointer_mod_kind(&self) -> Option<StackPointerModKind> {
        StackPointerModKind::from_bits(self.flag & 0b11)
    }

    fn decode(buf: &[u8; RECORD_SIZE as usize]) -> Option<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let ty_raw = cursor.read_u32::<LittleEndian>().ok()?;
        let flag = cursor.read_u8().ok()?;
        let _pad = cursor.read_u8().ok()?;
        let size0 = cursor.read_u16::<LittleEndian>().ok()?;
        let p1 = cursor.read_u64::<LittleEndian>().ok()?;
        let p2 = cursor.read_u64::<LittleEndian>().ok()?;
        let ty = RecordType::from_u32(ty_raw)?;
        Some(RawRecord {
            ty,
            flag,
            size0,
            p1,
            p2,
        })
    }
}

/// A raw trace file, memory-mapped and exposed as a sequence of records.
///
/// Holding the `Mmap` alive for the lifetime of the reader avoids loading
/// the (potentially hundreds-of-MB) file into a separate owned buffer.
pub struct RawTraceFile {
    mmap: Mmap,
}

impl RawTraceFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| TraceWalkError::io(path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| TraceWalkError::io(path, e))?;
        let len = mmap.len() as u64;
        if len % RECORD_SIZE != 0 {
            return Err(TraceWalkError::MalformedRecord {
                path: path.to_path_buf(),
                len,
                record_size: RECORD_SIZE,
            });
        }
        Ok(Self { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len() / RECORD_SIZE as usize
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Iterate records in file order. A record whose type tag is unknown
    /// is silently skipped rather than surfaced as an error: the record
    /// size is still fixed and known, so the stream stays in sync, and
    /// skipping costs nothing beyond that one record's information.
    pub fn records(&self) -> impl Iterator<Item = RawRecord> + '_ {
        self.mmap
            .chunks_exact(RECORD_SIZE as usize)
            .filter_map(|chunk| {
                let arr: &[u8; RECORD_SIZE as usize] = chunk.try_into().expect("chunks_exact");
                RawRecord::decode(arr)
            })
    }
}
