// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mutable regions. One control block serves all three flavours: an RC
//! region counts per-object references, a GC region leaves counting to a
//! tracing collector, an arena frees its members en masse. Frame-local
//! regions are RC regions owned by a stack frame.
//!
//! Regions form a forest: a region has at most one parent, recorded when a
//! field in the parent takes a reference to the region's root. A region
//! dies when its stack RC reaches zero with no parent, or with its owning
//! frame.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::ptr::NonNull;

use vbci_bytecode::{RegionType, TypeId};

use crate::array::ArrPtr;
use crate::error::ErrorKind;
use crate::header::HeaderPtr;
use crate::location::Location;
use crate::object::ObjPtr;
use crate::program::{Class, Program};

pub struct Region {
    kind: RegionType,
    readonly: Cell<bool>,
    /// Set while a behaviour closure owns the region root.
    captured: Cell<bool>,
    finalizing: Cell<bool>,
    stack_rc: Cell<u32>,
    parent: Cell<Option<RegionPtr>>,
    children: RefCell<HashSet<RegionPtr>>,
    headers: RefCell<HashSet<HeaderPtr>>,
    frame_local: Option<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionPtr(NonNull<Region>);

// A mutable region is reachable from exactly one frame or cown at a time;
// the ownership protocol serialises access.
unsafe impl Send for RegionPtr {}
unsafe impl Sync for RegionPtr {}

impl RegionPtr {
    pub fn alloc(kind: RegionType) -> RegionPtr {
        RegionPtr::alloc_inner(kind, None)
    }

    /// The per-frame region; always reference counted.
    pub fn alloc_frame_local(frame_index: usize) -> RegionPtr {
        RegionPtr::alloc_inner(RegionType::Rc, Some(frame_index))
    }

    fn alloc_inner(kind: RegionType, frame_local: Option<usize>) -> RegionPtr {
        let region = Box::new(Region {
            kind,
            readonly: Cell::new(false),
            captured: Cell::new(false),
            finalizing: Cell::new(false),
            stack_rc: Cell::new(0),
            parent: Cell::new(None),
            children: RefCell::new(HashSet::new()),
            headers: RefCell::new(HashSet::new()),
            frame_local,
        });
        let ptr = RegionPtr(NonNull::new(Box::into_raw(region)).unwrap());
        tracing::trace!(region = ?ptr, ?kind, "created region");
        ptr
    }

    pub fn from_usize(raw: usize) -> Option<RegionPtr> {
        NonNull::new(raw as *mut Region).map(RegionPtr)
    }

    pub fn as_usize(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// The region must be live; the protocol guarantees single-threaded
    /// access while it is mutable.
    pub unsafe fn get<'a>(self) -> &'a Region {
        &*self.0.as_ptr()
    }

    pub fn location(self) -> Location {
        Location::region(self)
    }

    /// # Safety
    /// Only the collector may call this, once the region is unreachable.
    pub unsafe fn free_box(self) {
        drop(Box::from_raw(self.0.as_ptr()));
    }
}

impl Region {
    fn ptr(&self) -> RegionPtr {
        RegionPtr(NonNull::from(self))
    }

    pub fn kind(&self) -> RegionType {
        self.kind
    }

    pub fn frame_local(&self) -> Option<usize> {
        self.frame_local
    }

    pub fn parent(&self) -> Option<RegionPtr> {
        self.parent.get()
    }

    pub fn stack_rc(&self) -> u32 {
        self.stack_rc.get()
    }

    pub fn readonly(&self) -> bool {
        self.readonly.get()
    }

    pub fn captured(&self) -> bool {
        self.captured.get()
    }

    pub fn set_captured(&self, captured: bool) {
        self.captured.set(captured);
    }

    pub fn finalizing(&self) -> bool {
        self.finalizing.get()
    }

    /// Per-object reference counting is live only for writable RC regions
    /// that are not currently tearing down.
    pub fn enable_rc(&self) -> bool {
        self.kind == RegionType::Rc && !self.readonly.get() && !self.finalizing.get()
    }

    pub fn stack_inc(&self) {
        if !self.readonly.get() {
            self.stack_rc.set(self.stack_rc.get() + 1);
        }
    }

    pub fn stack_inc_n(&self, n: u32) {
        if !self.readonly.get() {
            self.stack_rc.set(self.stack_rc.get() + n);
        }
    }

    /// Drop one incoming stack or cross-region reference; the region is
    /// torn down when the count reaches zero with no parent.
    pub fn stack_dec(&self, prog: &Program) {
        if self.readonly.get() {
            return;
        }
        let rc = self.stack_rc.get();
        debug_assert!(rc > 0);
        self.stack_rc.set(rc - 1);
        self.maybe_collect(prog);
    }

    fn maybe_collect(&self, prog: &Program) {
        if self.stack_rc.get() == 0
            && self.parent.get().is_none()
            && !self.finalizing.get()
            && self.frame_local.is_none()
        {
            crate::collect::collect_region(self.ptr(), prog);
        }
    }

    pub fn is_ancestor_of(&self, r: RegionPtr) -> bool {
        let me = self.ptr();
        let mut cur = unsafe { r.get().parent() };
        while let Some(p) = cur {
            if p == me {
                return true;
            }
            cur = unsafe { p.get().parent() };
        }
        false
    }

    /// Record this region as a child of `p`. One parent only.
    pub fn set_parent(&self, p: RegionPtr) {
        debug_assert!(!self.readonly.get());
        debug_assert!(self.parent.get().is_none());
        self.parent.set(Some(p));
        unsafe {
            p.get().children.borrow_mut().insert(self.ptr());
        }
    }

    pub fn clear_parent(&self, prog: &Program) {
        debug_assert!(!self.readonly.get());
        if let Some(p) = self.parent.take() {
            unsafe {
                p.get().children.borrow_mut().remove(&self.ptr());
            }
        }
        self.maybe_collect(prog);
    }

    /// Allocate an object belonging to this region.
    pub fn object(&self, cls: &Class) -> ObjPtr {
        let obj = ObjPtr::alloc(cls, self.ptr().location());
        self.headers.borrow_mut().insert(obj.header());
        // The fresh handle is register-resident.
        self.stack_inc();
        obj
    }

    /// Allocate an array of `type_id` (an array-modified id).
    pub fn array(&self, type_id: TypeId, size: usize, prog: &Program) -> Result<ArrPtr, ErrorKind> {
        let (vt, _ffi, stride) = prog.layout_type_id(type_id.unmod())?;
        let arr = ArrPtr::alloc(self.ptr().location(), type_id, vt, size, stride);
        self.headers.borrow_mut().insert(arr.header());
        self.stack_inc();
        Ok(arr)
    }

    pub fn insert(&self, h: HeaderPtr) {
        self.headers.borrow_mut().insert(h);
    }

    pub fn remove(&self, h: HeaderPtr) {
        self.headers.borrow_mut().remove(&h);
    }

    pub fn member_count(&self) -> usize {
        self.headers.borrow().len()
    }

    /// Finalize every member, then free their memory. The finalizing flag
    /// suppresses per-object RC so teardown cannot re-enter itself.
    pub fn free_contents(&self, prog: &Program) {
        self.finalizing.set(true);
        let members: Vec<HeaderPtr> = self.headers.borrow().iter().copied().collect();
        for h in &members {
            if h.is_array() {
                ArrPtr::from_header(*h).finalize(prog);
            } else {
                ObjPtr::from_header(*h).finalize(prog);
            }
        }
        for h in &members {
            tracing::trace!(header = ?h, "deallocating region member");
            unsafe {
                if h.is_array() {
                    ArrPtr::from_header(*h).free_memory();
                } else {
                    ObjPtr::from_header(*h).free_memory(prog);
                }
            }
        }
        self.headers.borrow_mut().clear();
    }

}

impl RegionPtr {
    /// Full teardown driven by the collect worklist: contents, child
    /// links, then the control block itself.
    pub fn deallocate(self, prog: &Program) {
        unsafe {
            self.get().free_contents(prog);
            let children: Vec<RegionPtr> = self.get().children.borrow_mut().drain().collect();
            for child in children {
                let c = child.get();
                if c.parent.get() == Some(self) {
                    c.parent.set(None);
                    c.maybe_collect(prog);
                }
            }
            self.free_box();
        }
    }
}

impl std::fmt::Debug for RegionPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "region@{:p}", self.0.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use crate::value::Value;
    use vbci_bytecode::{BytecodeBuilder, Op, ValueType};

    fn test_program(fields: &[(u32, TypeId)]) -> Program {
        let mut b = BytecodeBuilder::new();
        let main = b.declare_function(&[], TypeId::prim(ValueType::I32), 1);
        b.label(main);
        b.const_i32(0, 0);
        b.op(Op::Return).u(0);
        b.add_class(fields, &[]);
        crate::loader::parse(std::path::Path::new("<unit>"), &b.finish()).unwrap()
    }

    #[test]
    fn stack_rc_tracks_register_handles() {
        let prog = test_program(&[(0, TypeId::prim(ValueType::I32)), (1, TypeId::DYN)]);
        let region = RegionPtr::alloc(RegionType::Rc);
        unsafe {
            // Pin the region so the last handle drop is observable.
            region.get().stack_inc();

            let cls = prog.cls(0).unwrap();
            let obj = region.get().object(cls);
            assert_eq!(region.get().stack_rc(), 2);
            assert_eq!(obj.header().rc(), 1);

            let v = Value::Object(obj, false);
            let mut v2 = v.copy_reg();
            assert_eq!(region.get().stack_rc(), 3);
            assert_eq!(obj.header().rc(), 2);

            v2.drop_reg(&prog);
            assert_eq!(region.get().stack_rc(), 2);
            assert_eq!(obj.header().rc(), 1);

            let mut v = v;
            v.drop_reg(&prog);
            // The object died with its last handle; only the pin remains.
            assert_eq!(region.get().member_count(), 0);
            assert_eq!(region.get().stack_rc(), 1);

            region.get().stack_dec(&prog); // frees the region
        }
    }

    #[test]
    fn cross_region_store_builds_a_parent_edge() {
        let prog = test_program(&[(0, TypeId::prim(ValueType::I32)), (1, TypeId::DYN)]);
        let cls = prog.cls(0).unwrap();

        let parent = RegionPtr::alloc(RegionType::Rc);
        let child = RegionPtr::alloc(RegionType::Rc);
        unsafe {
            parent.get().stack_inc();
            let holder = parent.get().object(cls);
            let item = child.get().object(cls);
            assert_eq!(child.get().stack_rc(), 1);

            let mut v = Value::Object(item, false);
            let mut prev = holder.store_field(1, true, &mut v, &prog).unwrap();
            assert!(prev.is_invalid());
            prev.drop_field(&prog);

            // The register handle became a parent edge.
            assert_eq!(child.get().parent(), Some(parent));
            assert_eq!(child.get().stack_rc(), 0);

            // A second entry edge into the same child is rejected.
            let item2 = child.get().object(cls);
            let holder2 = parent.get().object(cls);
            let mut v2 = Value::Object(item2, false);
            assert_eq!(
                holder2.store_field(1, true, &mut v2, &prog).unwrap_err(),
                ErrorKind::BadStore
            );
        }
    }

    #[test]
    fn arena_regions_disable_per_object_counting() {
        let prog = test_program(&[(0, TypeId::prim(ValueType::I32))]);
        let cls = prog.cls(0).unwrap();
        let region = RegionPtr::alloc(RegionType::Arena);
        unsafe {
            region.get().stack_inc();
            let obj = region.get().object(cls);
            let v = Value::Object(obj, false);
            let mut copy = v.copy_reg();
            // The stack RC still moves, the object count does not.
            assert_eq!(obj.header().rc(), 1);
            assert_eq!(region.get().stack_rc(), 3);
            copy.drop_reg(&prog);
            let mut v = v;
            v.drop_reg(&prog);
            assert_eq!(region.get().member_count(), 1);
            region.get().stack_dec(&prog);
        }
    }

    #[test]
    fn region_teardown_releases_nested_children() {
        let prog = test_program(&[(0, TypeId::prim(ValueType::I32)), (1, TypeId::DYN)]);
        let cls = prog.cls(0).unwrap();
        let parent = RegionPtr::alloc(RegionType::Rc);
        let child = RegionPtr::alloc(RegionType::Rc);
        unsafe {
            parent.get().stack_inc();
            let holder = parent.get().object(cls);
            let item = child.get().object(cls);
            let mut v = Value::Object(item, false);
            holder.store_field(1, true, &mut v, &prog).unwrap().drop_field(&prog);
            assert_eq!(child.get().parent(), Some(parent));

            // Dropping the last incoming reference tears down the whole
            // tree through the worklist; nothing left to observe, but the
            // walk must terminate without recursing into freed state.
            let mut root = Value::Object(holder, false);
            root.drop_reg(&prog);
            parent.get().stack_dec(&prog);
        }
    }
}
