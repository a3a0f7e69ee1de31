// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Arrays: a header, the element type, and contiguous element storage.
//! Primitive elements are inlined by stride; everything else is stored as
//! whole `Value`s. The element pointer one past the header block is the
//! C-facing view used by FFI.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use vbci_bytecode::{TypeId, ValueType};

use crate::error::ErrorKind;
use crate::header::{exchange, Header, HeaderPtr};
use crate::location::Location;
use crate::program::Program;
use crate::value::Value;

#[repr(C)]
pub struct Array {
    header: Header,
    type_id: u32,
    value_type: u8,
    _pad: [u8; 3],
    stride: u32,
    _pad2: u32,
    size: usize,
    alloc_bytes: usize,
}

/// Element storage begins immediately after the array header block.
pub const ELEMS_OFFSET: usize = std::mem::size_of::<Array>();

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrPtr(NonNull<Array>);

unsafe impl Send for ArrPtr {}
unsafe impl Sync for ArrPtr {}

impl ArrPtr {
    pub fn size_of(size: usize, stride: usize) -> usize {
        ELEMS_OFFSET + size * stride
    }

    /// Construct an array in caller-provided storage.
    ///
    /// # Safety
    /// `mem` must be valid, 8-aligned, zeroed and at least
    /// `size_of(size, stride)` long.
    pub unsafe fn init_at(
        mem: *mut u8,
        loc: Location,
        type_id: TypeId,
        value_type: ValueType,
        size: usize,
        stride: usize,
    ) -> ArrPtr {
        let arr = mem as *mut Array;
        (*arr).header.init(loc);
        (*arr).type_id = type_id.raw();
        (*arr).value_type = value_type as u8;
        (*arr)._pad = [0; 3];
        (*arr).stride = stride as u32;
        (*arr)._pad2 = 0;
        (*arr).size = size;
        (*arr).alloc_bytes = ArrPtr::size_of(size, stride);
        ArrPtr(NonNull::new_unchecked(arr))
    }

    pub fn alloc(
        loc: Location,
        type_id: TypeId,
        value_type: ValueType,
        size: usize,
        stride: usize,
    ) -> ArrPtr {
        unsafe {
            let bytes = ArrPtr::size_of(size, stride);
            let layout = Layout::from_size_align(bytes, 8).unwrap();
            let mem = alloc_zeroed(layout);
            assert!(!mem.is_null(), "array allocation failed");
            ArrPtr::init_at(mem, loc, type_id, value_type, size, stride)
        }
    }

    pub fn from_header(h: HeaderPtr) -> ArrPtr {
        debug_assert!(h.is_array());
        ArrPtr(NonNull::new(h.as_ptr() as *mut Array).unwrap())
    }

    /// Recover the handle from a C-facing element pointer; null is no
    /// array.
    pub fn from_elems_ptr(p: *mut u8) -> Option<ArrPtr> {
        if p.is_null() {
            return None;
        }
        NonNull::new(unsafe { p.sub(ELEMS_OFFSET) } as *mut Array).map(ArrPtr)
    }

    pub fn header(self) -> HeaderPtr {
        HeaderPtr::new(self.0.cast())
    }

    pub fn elems_ptr(self) -> *mut u8 {
        unsafe { (self.0.as_ptr() as *mut u8).add(ELEMS_OFFSET) }
    }

    pub fn type_id(self) -> TypeId {
        TypeId::from_raw(unsafe { (*self.0.as_ptr()).type_id })
    }

    pub fn content_type_id(self) -> TypeId {
        self.type_id().unmod()
    }

    pub fn value_type(self) -> ValueType {
        ValueType::try_from(unsafe { (*self.0.as_ptr()).value_type }).unwrap_or(ValueType::Invalid)
    }

    pub fn stride(self) -> usize {
        unsafe { (*self.0.as_ptr()).stride as usize }
    }

    pub fn len(self) -> usize {
        unsafe { (*self.0.as_ptr()).size }
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Shrink the apparent length; growth is never allowed.
    pub fn set_len(self, new_size: usize) {
        unsafe {
            if new_size < (*self.0.as_ptr()).size {
                (*self.0.as_ptr()).size = new_size;
            }
        }
    }

    pub fn allocation_size(self) -> usize {
        unsafe { (*self.0.as_ptr()).alloc_bytes }
    }

    fn slot(self, idx: usize) -> Result<*mut u8, ErrorKind> {
        if idx >= self.len() {
            return Err(ErrorKind::BadArrayIndex);
        }
        Ok(unsafe { self.elems_ptr().add(idx * self.stride()) })
    }

    /// Borrow the element's value; the caller takes its own increment.
    pub fn load_elem(self, idx: usize) -> Result<Value, ErrorKind> {
        Ok(Value::from_addr(self.value_type(), self.slot(idx)?))
    }

    pub fn store_elem(
        self,
        idx: usize,
        is_move: bool,
        src: &mut Value,
        prog: &Program,
    ) -> Result<Value, ErrorKind> {
        if !prog.subtype(src.type_id(prog), self.content_type_id()) {
            return Err(ErrorKind::BadType);
        }
        let addr = self.slot(idx)?;
        unsafe { exchange(self.header(), addr, self.value_type(), src, is_move, prog) }
    }

    pub fn trace(self, out: &mut Vec<HeaderPtr>) {
        if !matches!(
            self.value_type(),
            ValueType::Object | ValueType::Array | ValueType::Invalid
        ) {
            return;
        }
        for i in 0..self.len() {
            let Ok(v) = self.load_elem(i) else { continue };
            if let Some(h) = v.header() {
                let loc = h.location();
                if loc.is_region() || loc.is_stack() || loc.is_pending() {
                    out.push(h);
                }
            }
        }
    }

    /// Drop every element; idempotent, like object finalization.
    pub fn finalize(self, prog: &Program) {
        if !matches!(
            self.value_type(),
            ValueType::Object | ValueType::Array | ValueType::Cown | ValueType::Invalid
        ) {
            return;
        }
        let loc = self.header().location();
        let stacky = loc.is_stack()
            || loc
                .as_region()
                .is_some_and(|r| unsafe { r.get().frame_local().is_some() });
        let stride = self.stride();
        for i in 0..self.len() {
            let addr = unsafe { self.elems_ptr().add(i * stride) };
            let mut v = Value::from_addr(self.value_type(), addr);
            let cross = v.region().is_some() && v.region() != loc.as_region();
            v.drop_field_flavored(stacky && cross, prog);
            unsafe {
                std::ptr::write_bytes(addr, 0, stride);
            }
        }
    }

    /// # Safety
    /// Only teardown paths may free, after finalization.
    pub unsafe fn free_memory(self) {
        let layout = Layout::from_size_align(self.allocation_size(), 8).unwrap();
        dealloc(self.0.as_ptr() as *mut u8, layout);
    }
}

impl std::fmt::Debug for ArrPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "array[{}]@{:p}", self.len(), self.0.as_ptr())
    }
}
