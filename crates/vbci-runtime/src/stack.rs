// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The per-thread bump allocator for stack-located objects and arrays.
//! Fixed-size chunks; a save/restore pair brackets each frame. When an
//! allocation would straddle a chunk boundary, a sentinel header is
//! written into the slack so walkers know to skip to the next chunk.

use vbci_bytecode::{TypeId, ValueType};

use crate::array::ArrPtr;
use crate::error::ErrorKind;
use crate::header::{Header, HeaderPtr, SENTINEL_TYPE_ID};
use crate::location::Location;
use crate::program::Program;

pub const CHUNK_SIZE: usize = 1024;

#[repr(C, align(16))]
struct Chunk([u8; CHUNK_SIZE]);

/// A saved stack top.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StackIdx {
    chunk: usize,
    offset: usize,
}

#[derive(Default)]
pub struct Stack {
    chunks: Vec<Box<Chunk>>,
    top: StackIdx,
}

/// A sentinel fills the header-plus-meta prefix of an allocation so a
/// walker can recognise it by type id alone.
#[repr(C)]
struct Sentinel {
    header: Header,
    type_id: u32,
    _pad: u32,
}

impl Stack {
    pub fn new() -> Stack {
        Stack::default()
    }

    pub fn save(&self) -> StackIdx {
        self.top
    }

    pub fn restore(&mut self, idx: StackIdx) {
        self.top = idx;
    }

    /// Bump-allocate `size` bytes (rounded to 8). Fails for requests
    /// larger than a chunk.
    pub fn alloc(&mut self, size: usize) -> Result<*mut u8, ErrorKind> {
        let size = (size + 7) & !7;
        if size > CHUNK_SIZE {
            return Err(ErrorKind::BadAllocTarget);
        }

        if self.top.offset + size > CHUNK_SIZE {
            let remaining = CHUNK_SIZE - self.top.offset;
            if remaining >= std::mem::size_of::<Sentinel>() {
                unsafe {
                    let p = self.chunks[self.top.chunk].0.as_mut_ptr().add(self.top.offset)
                        as *mut Sentinel;
                    (*p).header.init(Location::stack(0));
                    (*p).type_id = SENTINEL_TYPE_ID;
                    (*p)._pad = 0;
                }
            }
            self.top.chunk += 1;
            self.top.offset = 0;
        }

        if self.top.chunk >= self.chunks.len() {
            self.chunks.push(Box::new(Chunk([0; CHUNK_SIZE])));
            self.top.chunk = self.chunks.len() - 1;
            self.top.offset = 0;
        }

        let ptr = unsafe {
            self.chunks[self.top.chunk]
                .0
                .as_mut_ptr()
                .add(self.top.offset)
        };
        // Stale bytes from a previous frame must not masquerade as live
        // values.
        unsafe {
            std::ptr::write_bytes(ptr, 0, size);
        }
        self.top.offset += size;
        Ok(ptr)
    }

    /// Allocate a stack array for the frame at `frame_id`.
    pub fn array(
        &mut self,
        frame_id: Location,
        type_id: TypeId,
        size: usize,
        prog: &Program,
    ) -> Result<ArrPtr, ErrorKind> {
        let (vt, _ffi, stride) = prog.layout_type_id(type_id.unmod())?;
        let bytes = ArrPtr::size_of(size, stride);
        let mem = self.alloc(bytes)?;
        Ok(unsafe { ArrPtr::init_at(mem, frame_id, type_id, vt, size, stride) })
    }

    /// Visit the live headers between two save points, oldest first.
    pub fn visit_headers(
        &mut self,
        start: StackIdx,
        end: StackIdx,
        prog: &Program,
        mut f: impl FnMut(HeaderPtr),
    ) {
        let min_alloc = std::mem::size_of::<Sentinel>();
        for c in start.chunk..=end.chunk.min(self.chunks.len().saturating_sub(1)) {
            let mut offset = if c == start.chunk { start.offset } else { 0 };
            let limit = if c == end.chunk { end.offset } else { CHUNK_SIZE };
            while offset + min_alloc <= limit {
                let h = unsafe {
                    HeaderPtr::from_raw(self.chunks[c].0.as_mut_ptr().add(offset) as *mut Header)
                        .unwrap()
                };
                if h.is_sentinel() {
                    break;
                }
                let size = if h.is_array() {
                    ArrPtr::from_header(h).allocation_size()
                } else {
                    crate::object::ObjPtr::from_header(h).allocation_size(prog)
                };
                if size == 0 {
                    break;
                }
                f(h);
                offset += (size + 7) & !7;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_restore_round_trip() {
        let mut stack = Stack::new();
        let save = stack.save();
        let a = stack.alloc(64).unwrap();
        let b = stack.alloc(64).unwrap();
        assert_ne!(a, b);
        stack.restore(save);
        let c = stack.alloc(64).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn oversized_allocations_fail() {
        let mut stack = Stack::new();
        assert_eq!(
            stack.alloc(CHUNK_SIZE + 1).unwrap_err(),
            ErrorKind::BadAllocTarget
        );
    }

    #[test]
    fn chunk_overflow_moves_to_next_chunk() {
        let mut stack = Stack::new();
        let a = stack.alloc(CHUNK_SIZE - 8).unwrap();
        let b = stack.alloc(256).unwrap();
        // Different chunks, both 8-aligned.
        assert_ne!(a as usize & !0x3FF, b as usize & !0x3FF);
        assert_eq!(b as usize & 7, 0);
    }
}
