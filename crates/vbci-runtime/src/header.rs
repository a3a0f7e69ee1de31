// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The 16-byte allocation header shared by objects and arrays, and the
//! reference-count discipline built on it.
//!
//! Unit model. A register-resident handle to a region allocation holds one
//! unit of the allocation's refcount *and* one unit of the region's stack
//! RC. A field-resident handle holds the refcount unit only, unless the
//! containing allocation is itself stack- or frame-local-resident and the
//! target lives in a different region, in which case the field is still a
//! stack-resident reference and keeps the stack-RC unit. A field in one
//! region referring into a different region is recorded as a parent edge on
//! the target region instead.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use vbci_bytecode::TypeId;

use crate::error::ErrorKind;
use crate::location::Location;
use crate::program::Program;
use crate::region::RegionPtr;
use crate::value::Value;

/// Type-id marker for stack sentinel headers; never a real class or array.
pub const SENTINEL_TYPE_ID: u32 = u32::MAX;

#[repr(C)]
pub struct Header {
    rc: AtomicU32,
    _pad: u32,
    loc: std::sync::atomic::AtomicUsize,
}

impl Header {
    pub fn init(&mut self, loc: Location) {
        self.rc = AtomicU32::new(1);
        self._pad = 0;
        self.loc = std::sync::atomic::AtomicUsize::new(loc.raw());
    }
}

/// A raw handle to an allocation header. The region ownership protocol, not
/// the type system, guarantees exclusive access: mutable allocations are
/// reachable from exactly one frame or cown at a time, immutable ones are
/// frozen.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderPtr(NonNull<Header>);

unsafe impl Send for HeaderPtr {}
unsafe impl Sync for HeaderPtr {}

impl HeaderPtr {
    pub fn new(ptr: NonNull<Header>) -> HeaderPtr {
        HeaderPtr(ptr)
    }

    pub fn from_raw(ptr: *mut Header) -> Option<HeaderPtr> {
        NonNull::new(ptr).map(HeaderPtr)
    }

    pub fn as_ptr(self) -> *mut Header {
        self.0.as_ptr()
    }

    pub fn as_usize(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn location(self) -> Location {
        unsafe { Location::from_raw((*self.0.as_ptr()).loc.load(Ordering::Relaxed)) }
    }

    pub fn set_location(self, loc: Location) {
        unsafe { (*self.0.as_ptr()).loc.store(loc.raw(), Ordering::Relaxed) }
    }

    pub fn rc(self) -> u32 {
        unsafe { (*self.0.as_ptr()).rc.load(Ordering::Relaxed) }
    }

    pub fn set_rc(self, rc: u32) {
        unsafe { (*self.0.as_ptr()).rc.store(rc, Ordering::Relaxed) }
    }

    /// The type id stored immediately after the header: the class id for
    /// objects, the (array-modified) element type id for arrays.
    pub fn type_id(self) -> TypeId {
        unsafe {
            let meta = (self.as_ptr() as *const u8).add(std::mem::size_of::<Header>());
            TypeId::from_raw(*(meta as *const u32))
        }
    }

    pub fn is_array(self) -> bool {
        self.type_id().is_array()
    }

    pub fn is_sentinel(self) -> bool {
        self.type_id().raw() == SENTINEL_TYPE_ID
    }

    pub fn region(self) -> Option<RegionPtr> {
        self.location().as_region()
    }

    /// Whether a handle to this allocation may cross a cown boundary:
    /// immutable, immortal, or the root of a parentless uncaptured region.
    pub fn sendable(self) -> bool {
        let loc = self.location();
        if loc.is_immutable() || loc.is_immortal() {
            return true;
        }
        match loc.as_region() {
            Some(r) => unsafe {
                let r = r.get();
                r.frame_local().is_none() && r.parent().is_none() && !r.captured()
            },
            None => false,
        }
    }

    /// Increment for a new handle. `register` handles also pin the region.
    pub fn inc(self, register: bool) {
        let loc = self.location();
        if let Some(scc) = loc.as_scc() {
            scc.arc_inc();
            return;
        }
        if loc.no_rc() || loc.is_immutable() {
            return;
        }
        if let Some(r) = loc.as_region() {
            unsafe {
                if register {
                    r.get().stack_inc();
                }
                if r.get().enable_rc() {
                    let h = self.0.as_ptr();
                    (*h).rc.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Decrement for a dying handle; frees the allocation (and possibly its
    /// region) through the collect worklist when counts reach zero.
    pub fn dec(self, register: bool, prog: &Program) {
        let loc = self.location();
        if let Some(scc) = loc.as_scc() {
            scc.arc_dec(prog);
            return;
        }
        if loc.no_rc() || loc.is_immutable() {
            return;
        }
        if let Some(r) = loc.as_region() {
            unsafe {
                if r.get().enable_rc() {
                    let h = self.0.as_ptr();
                    if (*h).rc.fetch_sub(1, Ordering::Relaxed) == 1 {
                        tracing::trace!(header = ?self.as_ptr(), "free");
                        crate::collect::collect_header(self, prog);
                    }
                }
                if register {
                    r.get().stack_dec(prog);
                }
            }
        }
    }
}

impl std::fmt::Debug for HeaderPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "header@{:p}", self.0.as_ptr())
    }
}

/// Store admission checks: invariants 5–7 of the data model. Returns false
/// when the store would let a younger value escape into an older target, a
/// stack value into a region, or would break the region forest.
pub fn safe_store(target: HeaderPtr, src: &Value) -> bool {
    let tloc = target.location();
    if tloc.is_immutable() || tloc.is_immortal() {
        return false;
    }

    let sloc = src.location();
    let target_region = tloc.as_region();
    let target_frame = tloc.frame_index();

    // Stack and frame-local targets admit values pinned no younger than
    // themselves; real regions admit no stack-pinned values at all. A
    // stack reference held by a frame-local allocation is legal until the
    // graph tries to escape, at which point the drag rejects it.
    match target_frame {
        Some(tf) => {
            if let Some(sf) = sloc.frame_index() {
                if sf > tf {
                    return false;
                }
            }
        }
        None => {
            let tr = target_region.expect("mutable non-stack target has a region");
            if sloc.frame_index().is_some() || sloc.is_stack() {
                return false;
            }
            if let Some(sr) = sloc.as_region() {
                if sr != tr {
                    unsafe {
                        if sr.get().parent().is_some() || sr.get().is_ancestor_of(tr) {
                            return false;
                        }
                    }
                }
            }
        }
    }
    true
}

/// The full "old out, new in" exchange behind every field and element
/// store. `slot` addresses the raw storage, decoded by `slot_vt`. Returns
/// the previous value, lifted into a register-flavoured handle.
///
/// # Safety
/// `slot` must point into `target`'s own storage and match `slot_vt`.
pub unsafe fn exchange(
    target: HeaderPtr,
    slot: *mut u8,
    slot_vt: vbci_bytecode::ValueType,
    src: &mut Value,
    is_move: bool,
    prog: &Program,
) -> Result<Value, ErrorKind> {
    if !safe_store(target, src) {
        return Err(ErrorKind::BadStore);
    }

    let tloc = target.location();
    let target_region = tloc.as_region();
    let stacky = tloc.is_stack()
        || target_region.is_some_and(|r| unsafe { r.get().frame_local().is_some() });

    // Lift the previous value out: it moves from field residency to
    // register residency.
    let mut prev = Value::from_addr(slot_vt, slot);
    if let Some(pr) = prev.location().as_region() {
        let cross = Some(pr) != target_region;
        if !(stacky && cross) {
            pr.get().stack_inc();
        }
        if !stacky && cross {
            if let Some(tr) = target_region {
                if pr.get().parent() == Some(tr) {
                    pr.get().clear_parent(prog);
                }
            }
        }
    }
    // A readonly bit never survives storage; loads reapply the target's.
    prev.clear_readonly();

    let src_region = src.location().as_region();
    let cross = src_region.is_some() && src_region != target_region;

    if is_move {
        let v = src.take();
        if let Some(sr) = src_region {
            if !stacky && cross {
                if let Some(tr) = target_region {
                    sr.get().set_parent(tr);
                }
            }
            if !(stacky && cross) {
                sr.get().stack_dec(prog);
            }
        }
        v.write_addr(slot_vt, slot);
    } else {
        // Copy: the register keeps its units; the new field edge gets its
        // own refcount unit, plus a stack unit or parent edge as residency
        // demands.
        let v = src.copy_field();
        if let Some(sr) = src_region {
            if stacky && cross {
                sr.get().stack_inc();
            }
            if !stacky && cross {
                if let Some(tr) = target_region {
                    sr.get().set_parent(tr);
                }
            }
        }
        v.write_addr(slot_vt, slot);
    }

    Ok(prev)
}

/// One immutable strongly-connected component produced by freeze: an atomic
/// refcount over a set of member allocations that live and die together.
pub struct SccBlock {
    rc: AtomicU32,
    pub members: Vec<HeaderPtr>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SccPtr(NonNull<SccBlock>);

unsafe impl Send for SccPtr {}
unsafe impl Sync for SccPtr {}

impl SccPtr {
    pub fn alloc(rc: u32, members: Vec<HeaderPtr>) -> SccPtr {
        let block = Box::new(SccBlock {
            rc: AtomicU32::new(rc),
            members,
        });
        SccPtr(NonNull::new(Box::into_raw(block)).unwrap())
    }

    pub fn from_usize(raw: usize) -> Option<SccPtr> {
        NonNull::new(raw as *mut SccBlock).map(SccPtr)
    }

    pub fn as_usize(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn rc(self) -> u32 {
        unsafe { (*self.0.as_ptr()).rc.load(Ordering::Acquire) }
    }

    pub fn arc_inc(self) {
        unsafe {
            (*self.0.as_ptr()).rc.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn arc_dec(self, prog: &Program) {
        unsafe {
            if (*self.0.as_ptr()).rc.fetch_sub(1, Ordering::AcqRel) == 1 {
                crate::collect::collect_scc(self, prog);
            }
        }
    }

    /// # Safety
    /// Only the collector may call this, after the count reached zero.
    pub unsafe fn free(self, prog: &Program) {
        let block = Box::from_raw(self.0.as_ptr());
        for h in &block.members {
            if h.is_array() {
                crate::array::ArrPtr::from_header(*h).finalize(prog);
                crate::array::ArrPtr::from_header(*h).free_memory();
            } else {
                crate::object::ObjPtr::from_header(*h).finalize(prog);
                crate::object::ObjPtr::from_header(*h).free_memory(prog);
            }
        }
    }
}
