//! Preprocessed trace model and on-disk wire format.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::alloc_tracker::AllocationTracker;
use crate::error::{Result, TraceWalkError};
use crate::image_map::ImageMap;
use crate::record::BranchKind;
use crate::stack_tracker::StackFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessedEntry {
    HeapAlloc {
        id: u32,
        size: u64,
        address: u64,
    },
    HeapFree {
        id: u32,
    },
    StackAlloc {
        id: u32,
        instr_image_id: u32,
        instr_relative_addr: u64,
        size: u64,
        address: u64,
    },
    Branch {
        source_image_id: u32,
        source_relative_addr: u64,
        dest_image_id: u32,
        dest_relative_addr: u64,
        taken: bool,
        kind: BranchKind,
    },
    ImageMemoryAccess {
        is_write: bool,
        size: u16,
        instr_image_id: u32,
        instr_relative_addr: u64,
        mem_image_id: u32,
        mem_relative_addr: u64,
    },
    HeapMemoryAccess {
        is_write: bool,
        size: u16,
        instr_image_id: u32,
        instr_relative_addr: u64,
        heap_id: u32,
        relative_addr: u64,
    },
    StackMemoryAccess {
        is_write: bool,
        size: u16,
        instr_image_id: u32,
        instr_relative_addr: u64,
        stack_id: u32,
        relative_addr: u64,
    },
}

const TAG_HEAP_ALLOC: u8 = 0;
const TAG_HEAP_FREE: u8 = 1;
const TAG_STACK_ALLOC: u8 = 2;
const TAG_BRANCH: u8 = 3;
const TAG_IMAGE_MEM: u8 = 4;
const TAG_HEAP_MEM: u8 = 5;
const TAG_STACK_MEM: u8 = 6;

fn branch_kind_byte(kind: BranchKind) -> u8 {
    match kind {
        BranchKind::Jump => 1,
        BranchKind::Call => 2,
        BranchKind::Return => 3,
    }
}

fn branch_kind_from_byte(b: u8) -> Result<BranchKind> {
    Ok(match b {
        1 => BranchKind::Jump,
        2 => BranchKind::Call,
        3 => BranchKind::Return,
        other => {
            return Err(TraceWalkError::Decoding(format!(
                "invalid branch kind byte {other}"
            )))
        }
    })
}

impl PreprocessedEntry {
    /// The tag byte this entry encodes to; `encode(e).low4 == tag(e)` is a
    /// tested invariant.
    pub fn tag(&self) -> u8 {
        match self {
            Self::HeapAlloc { .. } => TAG_HEAP_ALLOC,
            Self::HeapFree { .. } => TAG_HEAP_FREE,
            Self::StackAlloc { .. } => TAG_STACK_ALLOC,
            Self::Branch { .. } => TAG_BRANCH,
            Self::ImageMemoryAccess { .. } => TAG_IMAGE_MEM,
            Self::HeapMemoryAccess { .. } => TAG_HEAP_MEM,
            Self::StackMemoryAccess { .. } => TAG_STACK_MEM,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.tag())?;
        match *self {
            Self::HeapAlloc { id, size, address } => {
                w.write_u32::<LittleEndian>(id)?;
                w.write_u64::<LittleEndian>(size)?;
                w.write_u64::<LittleEndian>(address)?;
            }
            Self::HeapFree { id } => {
                w.write_u32::<LittleEndian>(id)?;
            }
            Self::StackAlloc {
                id,
                instr_image_id,
                instr_relative_addr,
                size,
                address,
            } => {
                w.write_u32::<LittleEndian>(id)?;
                w.write_u32::<LittleEndian>(instr_image_id)?;
                w.write_u64::<LittleEndian>(instr_relative_addr)?;
                w.write_u64::<LittleEndian>(size)?;
                w.write_u64::<LittleEndian>(address)?;
            }
            Self::Branch {
                source_image_id,
                source_relative_addr,
                dest_image_id,
                dest_relative_addr,
                taken,
                kind,
            } => {
                w.write_u32::<LittleEndian>(source_image_id)?;
                w.write_u64::<LittleEndian>(source_relative_addr)?;
                w.write_u32::<LittleEndian>(dest_image_id)?;
                w.write_u64::<LittleEndian>(dest_relative_addr)?;
                w.write_u8(taken as u8)?;
                w.write_u8(branch_kind_byte(kind))?;
            }
            Self::ImageMemoryAccess {
                is_write,
                size,
                instr_image_id,
                instr_relative_addr,
                mem_image_id,
                mem_relative_addr,
            } => {
                w.write_u8(is_write as u8)?;
                w.write_u16::<LittleEndian>(size)?;
                w.write_u32::<LittleEndian>(instr_image_id)?;
                w.write_u64::<LittleEndian>(instr_relative_addr)?;
                w.write_u32::<LittleEndian>(mem_image_id)?;
                w.write_u64::<LittleEndian>(mem_relative_addr)?;
            }
            Self::HeapMemoryAccess {
                is_write,
                size,
                instr_image_id,
                instr_relative_addr,
                heap_id,
                relative_addr,
            } => {
                w.write_u8(is_write as u8)?;
                w.write_u16::<LittleEndian>(size)?;
                w.write_u32::<LittleEndian>(instr_image_id)?;
                w.write_u64::<LittleEndian>(instr_relative_addr)?;
                w.write_u32::<LittleEndian>(heap_id)?;
                w.write_u64::<LittleEndian>(relative_addr)?;
            }
            Self::StackMemoryAccess {
                is_write,
                size,
                instr_image_id,
                instr_relative_addr,
                stack_id,
                relative_addr,
            } => {
                w.write_u8(is_write as u8)?;
                w.write_u16::<LittleEndian>(size)?;
                w.write_u32::<LittleEndian>(instr_image_id)?;
                w.write_u64::<LittleEndian>(instr_relative_addr)?;
                w.write_u32::<LittleEndian>(stack_id)?;
                w.write_u64::<LittleEndian>(relative_addr)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>> {
        let tag = match r.read_u8() {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(TraceWalkError::Decoding(e.to_string())),
        };
        let entry = match tag {
            TAG_HEAP_ALLOC => Self::HeapAlloc {
                id: r.read_u32::<LittleEndian>()?,
                size: r.read_u64::<LittleEndian>()?,
                address: r.read_u64::<LittleEndian>()?,
            },
            TAG_HEAP_FREE => Self::HeapFree {
                id: r.read_u32::<LittleEndian>()?,
            },
            TAG_STACK_ALLOC => Self::StackAlloc {
                id: r.read_u32::<LittleEndian>()?,
                instr_image_id: r.read_u32::<LittleEndian>()?,
                instr_relative_addr: r.read_u64::<LittleEndian>()?,
                size: r.read_u64::<LittleEndian>()?,
                address: r.read_u64::<LittleEndian>()?,
            },
            TAG_BRANCH => {
                let source_image_id = r.read_u32::<LittleEndian>()?;
                let source_relative_addr = r.read_u64::<LittleEndian>()?;
                let dest_image_id = r.read_u32::<LittleEndian>()?;
                let dest_relative_addr = r.read_u64::<LittleEndian>()?;
                let taken = r.read_u8()? != 0;
                let kind = branch_kind_from_byte(r.read_u8()?)?;
                Self::Branch {
                    source_image_id,
                    source_relative_addr,
                    dest_image_id,
                    dest_relative_addr,
                    taken,
                    kind,
                }
            }
            TAG_IMAGE_MEM => Self::ImageMemoryAccess {
                is_write: r.read_u8()? != 0,
                size: r.read_u16::<LittleEndian>()?,
                instr_image_id: r.read_u32::<LittleEndian>()?,
                instr_relative_addr: r.read_u64::<LittleEndian>()?,
                mem_image_id: r.read_u32::<LittleEndian>()?,
                mem_relative_addr: r.read_u64::<LittleEndian>()?,
            },
            TAG_HEAP_MEM => Self::HeapMemoryAccess {
                is_write: r.read_u8()? != 0,
                size: r.read_u16::<LittleEndian>()?,
                instr_image_id: r.read_u32::<LittleEndian>()?,
                instr_relative_addr: r.read_u64::<LittleEndian>()?,
                heap_id: r.read_u32::<LittleEndian>()?,
                relative_addr: r.read_u64::<LittleEndian>()?,
            },
            TAG_STACK_MEM => Self::StackMemoryAccess {
                is_write: r.read_u8()? != 0,
                size: r.read_u16::<LittleEndian>()?,
                instr_image_id: r.read_u32::<LittleEndian>()?,
                instr_relative_addr: r.read_u64::<LittleEndian>()?,
                stack_id: r.read_u32::<LittleEndian>()?,
                relative_addr: r.read_u64::<LittleEndian>()?,
            },
            other => return Err(TraceWalkError::Decoding(format!("unknown tag {other}"))),
        };
        Ok(Some(entry))
    }
}

impl From<io::Error> for TraceWalkError {
    fn from(e: io::Error) -> Self {
        TraceWalkError::Decoding(e.to_string())
    }
}

/// State shared (read-only, after creation) by every trace produced under
/// one process invocation.
#[derive(Debug)]
pub struct TracePrefix {
    pub images: ImageMap,
    pub initial_heap: AllocationTracker,
    pub initial_stack: Vec<StackFrame>,
    pub last_heap_id: u32,
    pub last_stack_id: u32,
    pub sp_min: u64,
    pub sp_max: u64,
}

/// One testcase's preprocessed trace, plus a handle on the prefix it
/// extends.
#[derive(Debug)]
pub struct Trace {
    pub prefix: Arc<TracePrefix>,
    pub entries: Vec<PreprocessedEntry>,
    pub heap: AllocationTracker,
}

/// Writes the prefix header: image count, then per image
/// `{name_len:u32, name:utf8, interesting:u8}`, in stable id order.
pub fn write_prefix_header<W: Write>(w: &mut W, images: &ImageMap) -> io::Result<()> {
    w.write_u32::<LittleEndian>(images.len() as u32)?;
    for image in images.in_id_order() {
        let bytes = image.name.as_bytes();
        w.write_u32::<LittleEndian>(bytes.len() as u32)?;
        w.write_all(bytes)?;
        w.write_u8(image.interesting as u8)?;
    }
    Ok(())
}
