// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Objects: a header, the class id, and raw field storage laid out by
//! libffi so the memory image matches the C ABI. Field slots hold
//! primitives inline, handles as pointers to their payload storage, and
//! dynamically-typed fields as whole `Value`s.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use vbci_bytecode::{TypeId, ValueType};

use crate::error::ErrorKind;
use crate::header::{exchange, Header, HeaderPtr};
use crate::location::Location;
use crate::program::{Class, Program};
use crate::value::Value;

#[repr(C)]
pub struct Object {
    header: Header,
    type_id: u32,
    _pad: u32,
}

/// Field storage begins immediately after the object header block.
pub const FIELDS_OFFSET: usize = std::mem::size_of::<Object>();

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjPtr(NonNull<Object>);

unsafe impl Send for ObjPtr {}
unsafe impl Sync for ObjPtr {}

impl ObjPtr {
    /// Construct an object in caller-provided storage of `cls.size` bytes.
    ///
    /// # Safety
    /// `mem` must be valid, 8-aligned, zeroed and at least `cls.size` long.
    pub unsafe fn init_at(mem: *mut u8, cls: &Class, loc: Location) -> ObjPtr {
        let obj = mem as *mut Object;
        (*obj).header.init(loc);
        (*obj).type_id = cls.type_id.raw();
        (*obj)._pad = 0;
        ObjPtr(NonNull::new_unchecked(obj))
    }

    /// Heap-allocate an object of `cls`.
    pub fn alloc(cls: &Class, loc: Location) -> ObjPtr {
        unsafe {
            let layout = Layout::from_size_align(cls.size, 8).unwrap();
            let mem = alloc_zeroed(layout);
            assert!(!mem.is_null(), "object allocation failed");
            ObjPtr::init_at(mem, cls, loc)
        }
    }

    pub fn from_header(h: HeaderPtr) -> ObjPtr {
        debug_assert!(!h.is_array());
        ObjPtr(NonNull::new(h.as_ptr() as *mut Object).unwrap())
    }

    /// Recover the handle from a C-facing fields pointer; null is no
    /// object.
    pub fn from_fields_ptr(p: *mut u8) -> Option<ObjPtr> {
        if p.is_null() {
            return None;
        }
        NonNull::new(unsafe { p.sub(FIELDS_OFFSET) } as *mut Object).map(ObjPtr)
    }

    pub fn header(self) -> HeaderPtr {
        HeaderPtr::new(self.0.cast())
    }

    pub fn fields_ptr(self) -> *mut u8 {
        unsafe { (self.0.as_ptr() as *mut u8).add(FIELDS_OFFSET) }
    }

    pub fn class_index(self) -> u32 {
        let tid = TypeId::from_raw(unsafe { (*self.0.as_ptr()).type_id });
        tid.as_class().expect("object carries a class id")
    }

    pub fn field_index(self, field_name: u32, prog: &Program) -> Result<u32, ErrorKind> {
        let cls = prog.cls(self.class_index())?;
        cls.field_index(field_name).ok_or(ErrorKind::BadField)
    }

    fn slot(self, idx: u32, prog: &Program) -> Result<(*mut u8, ValueType), ErrorKind> {
        let cls = prog.cls(self.class_index())?;
        let field = cls.fields.get(idx as usize).ok_or(ErrorKind::BadField)?;
        Ok((
            unsafe { self.fields_ptr().add(field.offset) },
            field.value_type,
        ))
    }

    /// Borrow the field's value; the caller takes its own increment.
    pub fn load_field(self, idx: u32, prog: &Program) -> Result<Value, ErrorKind> {
        let (addr, vt) = self.slot(idx, prog)?;
        Ok(Value::from_addr(vt, addr))
    }

    /// Store into a field: type gate, ownership checks, old-out/new-in.
    pub fn store_field(
        self,
        idx: u32,
        is_move: bool,
        src: &mut Value,
        prog: &Program,
    ) -> Result<Value, ErrorKind> {
        let cls = prog.cls(self.class_index())?;
        let field = cls.fields.get(idx as usize).ok_or(ErrorKind::BadField)?;
        if !prog.subtype(src.type_id(prog), field.type_id) {
            return Err(ErrorKind::BadType);
        }
        let addr = unsafe { self.fields_ptr().add(field.offset) };
        unsafe { exchange(self.header(), addr, field.value_type, src, is_move, prog) }
    }

    /// Populate fields from the pending argument window, in declaration
    /// order. Arguments are consumed; on failure the remainder is dropped.
    pub fn init(self, args: &mut [Value], prog: &Program) -> Result<(), ErrorKind> {
        let cls = prog.cls(self.class_index())?;
        debug_assert_eq!(args.len(), cls.fields.len());
        for (i, arg) in args.iter_mut().enumerate() {
            let field = &cls.fields[i];
            let addr = unsafe { self.fields_ptr().add(field.offset) };
            let result =
                unsafe { exchange(self.header(), addr, field.value_type, arg, true, prog) };
            if let Err(e) = result {
                for rest in args.iter_mut().skip(i) {
                    rest.drop_reg(prog);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn finalizer(self, prog: &Program) -> Option<u32> {
        prog.cls(self.class_index()).ok().and_then(|c| c.finalizer())
    }

    /// Append every mutable object or array reachable through fields.
    pub fn trace(self, prog: &Program, out: &mut Vec<HeaderPtr>) {
        let Ok(cls) = prog.cls(self.class_index()) else {
            return;
        };
        for (i, field) in cls.fields.iter().enumerate() {
            if !matches!(
                field.value_type,
                ValueType::Object | ValueType::Array | ValueType::Invalid
            ) {
                continue;
            }
            let addr = unsafe { self.fields_ptr().add(field.offset) };
            let v = Value::from_addr(field.value_type, addr);
            if let Some(h) = v.header() {
                let loc = h.location();
                if loc.is_region() || loc.is_stack() || loc.is_pending() {
                    out.push(h);
                }
            }
        }
    }

    /// Drop every field. Idempotent: dropped slots are zeroed, and a
    /// zeroed slot decodes as invalid or null.
    pub fn finalize(self, prog: &Program) {
        let Ok(cls) = prog.cls(self.class_index()) else {
            return;
        };
        let loc = self.header().location();
        let stacky = loc.is_stack()
            || loc
                .as_region()
                .is_some_and(|r| unsafe { r.get().frame_local().is_some() });
        for field in &cls.fields {
            if !matches!(
                field.value_type,
                ValueType::Object | ValueType::Array | ValueType::Cown | ValueType::Invalid
            ) {
                continue;
            }
            let addr = unsafe { self.fields_ptr().add(field.offset) };
            let mut v = Value::from_addr(field.value_type, addr);
            // Cross-region fields from stack-resident containers carry a
            // stack-RC unit; release it with the refcount.
            let cross = v.region().is_some() && v.region() != loc.as_region();
            v.drop_field_flavored(stacky && cross, prog);
            unsafe {
                std::ptr::write_bytes(addr, 0, field.size);
            }
        }
    }

    pub fn allocation_size(self, prog: &Program) -> usize {
        prog.cls(self.class_index()).map(|c| c.size).unwrap_or(0)
    }

    /// # Safety
    /// Only teardown paths may free, after finalization.
    pub unsafe fn free_memory(self, prog: &Program) {
        let size = self.allocation_size(prog);
        let layout = Layout::from_size_align(size, 8).unwrap();
        dealloc(self.0.as_ptr() as *mut u8, layout);
    }
}

impl std::fmt::Debug for ObjPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "object@{:p}", self.0.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionPtr;
    use vbci_bytecode::{BytecodeBuilder, Op, RegionType};

    fn test_program() -> Program {
        let mut b = BytecodeBuilder::new();
        let main = b.declare_function(&[], TypeId::prim(ValueType::I32), 1);
        b.label(main);
        b.const_i32(0, 0);
        b.op(Op::Return).u(0);
        b.add_class(
            &[
                (10, TypeId::prim(ValueType::I32)),
                (11, TypeId::prim(ValueType::F64)),
                (12, TypeId::DYN),
            ],
            &[],
        );
        crate::loader::parse(std::path::Path::new("<unit>"), &b.finish()).unwrap()
    }

    #[test]
    fn typed_fields_round_trip() {
        let prog = test_program();
        let cls = prog.cls(0).unwrap();
        let region = RegionPtr::alloc(RegionType::Rc);
        unsafe {
            region.get().stack_inc();
            let obj = region.get().object(cls);

            obj.store_field(0, true, &mut Value::I32(7), &prog)
                .unwrap();
            obj.store_field(1, true, &mut Value::F64(1.5), &prog)
                .unwrap();
            assert!(matches!(obj.load_field(0, &prog), Ok(Value::I32(7))));
            assert!(matches!(obj.load_field(1, &prog), Ok(Value::F64(v)) if v == 1.5));
        }
    }

    #[test]
    fn field_names_resolve_to_indices() {
        let prog = test_program();
        let cls = prog.cls(0).unwrap();
        let region = RegionPtr::alloc(RegionType::Rc);
        unsafe {
            region.get().stack_inc();
            let obj = region.get().object(cls);
            assert_eq!(obj.field_index(11, &prog), Ok(1));
            assert_eq!(obj.field_index(99, &prog), Err(ErrorKind::BadField));
        }
    }

    #[test]
    fn stores_are_type_gated() {
        let prog = test_program();
        let cls = prog.cls(0).unwrap();
        let region = RegionPtr::alloc(RegionType::Rc);
        unsafe {
            region.get().stack_inc();
            let obj = region.get().object(cls);
            assert_eq!(
                obj.store_field(0, true, &mut Value::F64(0.0), &prog)
                    .unwrap_err(),
                ErrorKind::BadType
            );
            // The dyn field takes anything.
            obj.store_field(2, true, &mut Value::Bool(true), &prog)
                .unwrap();
        }
    }

    #[test]
    fn fields_pointer_round_trips() {
        let prog = test_program();
        let cls = prog.cls(0).unwrap();
        let region = RegionPtr::alloc(RegionType::Rc);
        unsafe {
            region.get().stack_inc();
            let obj = region.get().object(cls);
            let p = obj.fields_ptr();
            assert_eq!(ObjPtr::from_fields_ptr(p), Some(obj));
            assert_eq!(ObjPtr::from_fields_ptr(std::ptr::null_mut()), None);
        }
    }
}
