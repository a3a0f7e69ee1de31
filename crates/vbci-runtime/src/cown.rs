// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cowns: the only sanctioned cross-thread channel. A cown pairs a typed
//! content cell with its scheduler queue handle; acquisition order and
//! reader/writer admission live in the scheduler, the content and its
//! sendability checks live here.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use vbci_scheduler::CownHandle;

use vbci_bytecode::TypeId;

use crate::error::ErrorKind;
use crate::program::Program;
use crate::value::Value;

pub struct Cown {
    rc: AtomicU32,
    queue: CownHandle,
    type_id: TypeId,
    content: Value,
    program: Arc<Program>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CownPtr(NonNull<Cown>);

unsafe impl Send for CownPtr {}
unsafe impl Sync for CownPtr {}

impl CownPtr {
    /// Create a cown whose content must be a subtype of `type_id`. Nested
    /// cowns are rejected.
    pub fn create(type_id: TypeId, program: Arc<Program>) -> Result<CownPtr, ErrorKind> {
        if type_id.is_cown() {
            return Err(ErrorKind::BadType);
        }
        let cown = Box::new(Cown {
            rc: AtomicU32::new(1),
            queue: CownHandle::new(),
            type_id,
            content: Value::Invalid,
            program,
        });
        Ok(CownPtr(NonNull::new(Box::into_raw(cown)).unwrap()))
    }

    pub fn from_raw(raw: *mut std::ffi::c_void) -> Option<CownPtr> {
        NonNull::new(raw as *mut Cown).map(CownPtr)
    }

    pub fn as_raw(self) -> *mut std::ffi::c_void {
        self.0.as_ptr() as *mut std::ffi::c_void
    }

    pub fn content_type_id(self) -> TypeId {
        unsafe { (*self.0.as_ptr()).type_id }
    }

    pub fn queue(self) -> CownHandle {
        unsafe { (*self.0.as_ptr()).queue.clone() }
    }

    pub fn inc(self) {
        unsafe {
            (*self.0.as_ptr()).rc.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn dec(self, _prog: &Program) {
        unsafe {
            if (*self.0.as_ptr()).rc.fetch_sub(1, Ordering::AcqRel) == 1 {
                let mut cown = Box::from_raw(self.0.as_ptr());
                let program = cown.program.clone();
                cown.content.drop_reg(&program);
                drop(cown);
            }
        }
    }

    /// A copy of the content. The caller holds the cown acquired (or the
    /// runtime is quiescent); the scheduler serialises access.
    pub fn load(self) -> Value {
        unsafe { (*self.0.as_ptr()).content.copy_reg() }
    }

    /// Swap content. The incoming value must typecheck (errors are always
    /// admitted) and must be sendable; returns the previous content.
    pub fn store(self, is_move: bool, src: &mut Value, prog: &Program) -> Result<Value, ErrorKind> {
        unsafe {
            let cown = &mut *self.0.as_ptr();
            if !src.is_error() && !prog.subtype(src.type_id(prog), cown.type_id) {
                return Err(ErrorKind::BadType);
            }
            let next = if is_move { src.take() } else { src.copy_reg() };
            if !next.is_sendable() {
                let mut next = next;
                next.drop_reg(prog);
                return Err(ErrorKind::BadStore);
            }
            let prev = std::mem::replace(&mut cown.content, next);
            Ok(prev)
        }
    }
}

impl std::fmt::Debug for CownPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cown@{:p}", self.0.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbci_bytecode::{BytecodeBuilder, Op, ValueType};

    fn test_program() -> Arc<Program> {
        let mut b = BytecodeBuilder::new();
        let main = b.declare_function(&[], TypeId::prim(ValueType::I32), 1);
        b.label(main);
        b.const_i32(0, 0);
        b.op(Op::Return).u(0);
        Arc::new(crate::loader::parse(std::path::Path::new("<unit>"), &b.finish()).unwrap())
    }

    #[test]
    fn nested_cowns_are_rejected() {
        let prog = test_program();
        let nested = TypeId::prim(ValueType::I32).cown_of();
        assert_eq!(
            CownPtr::create(nested, prog).unwrap_err(),
            ErrorKind::BadType
        );
    }

    #[test]
    fn stores_are_typechecked_and_swap() {
        let prog = test_program();
        let cown = CownPtr::create(TypeId::prim(ValueType::I32), prog.clone()).unwrap();

        let mut v = Value::I32(5);
        let mut prev = cown.store(true, &mut v, &prog).unwrap();
        assert!(prev.is_invalid());
        prev.drop_reg(&prog);

        let mut wrong = Value::F64(1.0);
        assert_eq!(
            cown.store(true, &mut wrong, &prog).unwrap_err(),
            ErrorKind::BadType
        );

        // Errors are always admitted.
        let mut err = Value::Error(crate::error::ErrorInfo::hostside(ErrorKind::BadStore));
        let mut prev = cown.store(true, &mut err, &prog).unwrap();
        assert!(matches!(prev, Value::I32(5)));
        prev.drop_reg(&prog);

        cown.dec(&prog);
    }
}
