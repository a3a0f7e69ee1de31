// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The interpreter. One `Thread` lives in thread-local storage per OS
//! thread; behaviours dispatched by the scheduler run on the worker's own
//! instance. Frames share a single grow-on-demand register vector; a
//! frame's argument window doubles as the callee's register window, so a
//! call is one bump of the base index.

use std::cell::RefCell;
use std::ffi::c_void;
use std::sync::Arc;

use tracing::trace;
use vbci_bytecode::{CallType, Condition, Cursor, Op, RegionType, TypeId, ValueType};
use vbci_scheduler::Slot;

use crate::cown::CownPtr;
use crate::drag::drag_allocation;
use crate::error::{ErrorInfo, ErrorKind};
use crate::frame::Frame;
use crate::freeze::freeze;
use crate::location::Location;
use crate::object::ObjPtr;
use crate::program::{Class, Program};
use crate::region::RegionPtr;
use crate::stack::Stack;
use crate::value::Value;
use crate::vm::Vm;

thread_local! {
    static THREAD: RefCell<Thread> = RefCell::new(Thread::new());
}

pub struct Thread {
    stack: Stack,
    frames: Vec<Frame>,
    locals: Vec<Value>,
    finalize: Vec<ObjPtr>,
    /// Pending staged arguments in the current frame's argument window.
    args: usize,
    current_func: u32,
    current_pc: usize,
}

impl Thread {
    fn new() -> Thread {
        Thread {
            stack: Stack::new(),
            frames: Vec::with_capacity(16),
            locals: Vec::new(),
            finalize: Vec::new(),
            args: 0,
            current_func: u32::MAX,
            current_pc: 0,
        }
    }

    pub fn with<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
        THREAD.with(|t| f(&mut t.borrow_mut()))
    }

    /// Run `main` to completion on this thread.
    pub fn run_main(vm: &Arc<Vm>) -> Value {
        Thread::with(|t| t.thread_run(vm, vbci_bytecode::MAIN_FUNC_ID))
    }

    /// Run a callback synchronously with pre-staged arguments; used by the
    /// event-loop bridge.
    pub fn run_sync(vm: &Arc<Vm>, func: u32, args: Vec<Value>) {
        Thread::with(|t| {
            for arg in args {
                t.stage_arg(arg, &vm.program);
            }
            let mut ret = t.thread_run(vm, func);
            ret.drop_reg(&vm.program);
        });
    }

    fn thread_run(&mut self, vm: &Arc<Vm>, func: u32) -> Value {
        debug_assert!(self.frames.is_empty());
        let depth = self.frames.len();
        if let Err(kind) = self.pushframe(vm, func, 0, CallType::Catch) {
            return Value::Error(ErrorInfo::hostside(kind));
        }
        while self.frames.len() > depth {
            self.step(vm);
        }
        self.ensure_locals(1);
        self.locals[0].take()
    }

    // Register plumbing.

    fn fr(&self) -> &Frame {
        self.frames.last().expect("no current frame")
    }

    fn fr_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no current frame")
    }

    fn ensure_locals(&mut self, len: usize) {
        if self.locals.len() < len {
            self.locals.resize_with(len.max(64), Value::default);
        }
    }

    fn reg_index(&self, i: u64) -> usize {
        self.fr().local_index(i)
    }

    fn local(&mut self, i: u64) -> &mut Value {
        let idx = self.reg_index(i);
        self.ensure_locals(idx + 1);
        &mut self.locals[idx]
    }

    fn set_local(&mut self, i: u64, v: Value, prog: &Program) {
        self.local(i).assign(v, prog);
    }

    fn arg_index(&self, i: usize) -> usize {
        match self.frames.last() {
            Some(f) => f.arg_index(i),
            None => i,
        }
    }

    fn arg(&mut self, i: usize) -> &mut Value {
        let idx = self.arg_index(i);
        self.ensure_locals(idx + 1);
        &mut self.locals[idx]
    }

    fn stage_arg(&mut self, v: Value, prog: &Program) {
        let i = self.args;
        self.args += 1;
        self.arg(i).assign(v, prog);
    }

    fn drop_args(&mut self, prog: &Program) {
        for i in 0..self.args {
            let idx = self.arg_index(i);
            self.ensure_locals(idx + 1);
            self.locals[idx].drop_reg(prog);
        }
        self.args = 0;
    }

    /// A value's type id, with register refs refined through the register
    /// they point at.
    fn value_type_id(&self, v: &Value, prog: &Program) -> TypeId {
        if let Value::RegisterRef { index, .. } = v {
            if let Some(reg) = self.locals.get(*index) {
                return reg.type_id(prog).ref_of();
            }
        }
        v.type_id(prog)
    }

    // Argument checks.

    /// Arity and subtype gate for a call or FFI invocation. Consumes the
    /// staged-argument count and returns it; staged values stay in place
    /// as the callee's registers.
    fn check_args(
        &mut self,
        params: &[TypeId],
        vararg: bool,
        prog: &Program,
    ) -> Result<usize, ErrorKind> {
        let n = self.args;
        if n < params.len() || (!vararg && n > params.len()) {
            self.drop_args(prog);
            return Err(ErrorKind::BadArgs);
        }
        for (i, param) in params.iter().enumerate() {
            let idx = self.arg_index(i);
            self.ensure_locals(idx + 1);
            let tid = self.value_type_id(&self.locals[idx], prog);
            if !prog.subtype(tid, *param) {
                self.drop_args(prog);
                return Err(ErrorKind::BadType);
            }
        }
        self.args = 0;
        Ok(n)
    }

    /// Field-count and field-type gate for object construction.
    fn check_field_args(&mut self, cls: &Class, prog: &Program) -> Result<usize, ErrorKind> {
        let n = self.args;
        if n != cls.fields.len() {
            self.drop_args(prog);
            return Err(ErrorKind::BadArgs);
        }
        for (i, field) in cls.fields.iter().enumerate() {
            let idx = self.arg_index(i);
            self.ensure_locals(idx + 1);
            let tid = self.value_type_id(&self.locals[idx], prog);
            if !prog.subtype(tid, field.type_id) {
                self.drop_args(prog);
                return Err(ErrorKind::BadType);
            }
        }
        self.args = 0;
        Ok(n)
    }

    /// Populate a fresh object from the staged argument window.
    fn init_object(&mut self, obj: ObjPtr, n: usize, prog: &Program) -> Result<(), ErrorKind> {
        let base = self.arg_index(0);
        self.ensure_locals(base + n);
        let args = &mut self.locals[base..base + n];
        obj.init(args, prog)
    }

    // Frame discipline.

    fn pushframe(
        &mut self,
        vm: &Arc<Vm>,
        func_id: u32,
        dst: u64,
        calltype: CallType,
    ) -> Result<(), ErrorKind> {
        let prog = &vm.program;
        let func = prog.function(func_id)?;
        let registers = func.registers;
        let entry = *func.labels.first().ok_or(ErrorKind::BadLabel)?;
        let params = func.param_types.clone();
        self.check_args(&params, false, prog)?;

        let (index, base, finalize_base) = match self.frames.last_mut() {
            Some(f) => {
                f.calltype = calltype;
                (f.index + 1, f.base + f.registers, f.finalize_top)
            }
            None => (0, 0, 0),
        };

        self.ensure_locals(base + registers);
        let region = RegionPtr::alloc_frame_local(index);
        unsafe {
            // The frame itself keeps the region pinned.
            region.get().stack_inc();
        }
        self.frames.push(Frame {
            func: func_id,
            frame_id: Location::stack(index),
            index,
            save: self.stack.save(),
            base,
            registers,
            finalize_base,
            finalize_top: finalize_base,
            region,
            pc: entry,
            dst,
            calltype: CallType::Call,
        });
        Ok(())
    }

    fn popframe(&mut self, vm: &Arc<Vm>, mut ret: Value, mut condition: Condition) {
        let prog = &vm.program;
        let dst = self.fr().dst;

        // Unused staged arguments die with the frame.
        self.drop_args(prog);

        // Escape checks: nothing pinned to this frame may leave it.
        let frame_id = self.fr().frame_id;
        let frame_index = self.fr().index;
        let retloc = ret.location();
        if retloc == frame_id {
            ret = self.trap(ErrorKind::BadStackEscape);
            condition = Condition::Throw;
        } else if let Some(r) = retloc.as_region() {
            if unsafe { r.get().frame_local() } == Some(frame_index) {
                let dragged = if self.frames.len() > 1 {
                    let dest = self.frames[self.frames.len() - 2].region;
                    ret.header()
                        .map(|h| drag_allocation(dest, h, prog))
                        .unwrap_or(false)
                } else {
                    // The outermost frame drags into a fresh region.
                    let dest = RegionPtr::alloc(RegionType::Rc);
                    let ok = ret
                        .header()
                        .map(|h| drag_allocation(dest, h, prog))
                        .unwrap_or(false);
                    if !ok {
                        dest.deallocate(prog);
                    }
                    ok
                };
                if !dragged {
                    ret = self.trap(ErrorKind::BadStackEscape);
                    condition = Condition::Throw;
                }
            }
        }

        if condition == Condition::Return {
            let return_type = prog
                .function(self.fr().func)
                .map(|f| f.return_type)
                .unwrap_or(TypeId::DYN);
            if !ret.is_error() && !prog.subtype(self.value_type_id(&ret, prog), return_type) {
                ret = self.trap(ErrorKind::BadType);
                condition = Condition::Throw;
            }
        }

        self.teardown(vm, false);
        self.frames.pop();

        if self.frames.is_empty() {
            self.ensure_locals(1);
            self.locals[0].assign(ret, prog);
            return;
        }

        match self.fr().calltype {
            CallType::Call => match condition {
                // A Call unwraps one level of Raise.
                Condition::Raise => return self.popframe(vm, ret, Condition::Return),
                Condition::Throw => return self.popframe(vm, ret, Condition::Throw),
                Condition::Return => {}
            },
            CallType::Subcall => {
                if condition != Condition::Return {
                    return self.popframe(vm, ret, condition);
                }
            }
            // A Catch frame converts every condition into a plain return;
            // this also catches traps the VM itself raised.
            CallType::Catch => {}
        }

        self.set_local(dst, ret, prog);
        self.fr_mut().calltype = CallType::Call;
    }

    fn teardown(&mut self, vm: &Arc<Vm>, tailcall: bool) {
        let prog = &vm.program;
        let (base, registers, finalize_base, finalize_top, save, region) = {
            let f = self.fr();
            (
                f.base,
                f.registers,
                f.finalize_base,
                f.finalize_top,
                f.save,
                f.region,
            )
        };

        for i in 0..registers {
            self.ensure_locals(base + i + 1);
            self.locals[base + i].drop_reg(prog);
        }

        // User finalizers recorded by Stack allocations in this frame.
        let pending: Vec<ObjPtr> = self.finalize[finalize_base..finalize_top].to_vec();
        for obj in pending {
            if let Some(func) = obj.finalizer(prog) {
                self.run_finalizer(vm, func, obj);
            }
        }

        // Release whatever stack-resident allocations of this frame still
        // hold before their storage is reclaimed.
        let top = self.stack.save();
        self.stack.visit_headers(save, top, prog, |h| {
            if h.is_array() {
                crate::array::ArrPtr::from_header(h).finalize(prog);
            } else {
                ObjPtr::from_header(h).finalize(prog);
            }
        });

        if !tailcall {
            unsafe {
                region.get().free_contents(prog);
                region.free_box();
            }
        }

        self.stack.restore(save);
        self.finalize.truncate(finalize_base);
        self.fr_mut().finalize_top = finalize_base;
    }

    fn run_finalizer(&mut self, vm: &Arc<Vm>, func: u32, obj: ObjPtr) {
        let saved_args = self.args;
        self.args = 0;
        let depth = self.frames.len();
        self.stage_arg(Value::Object(obj, false), &vm.program);
        if self.pushframe(vm, func, 0, CallType::Catch).is_ok() {
            while self.frames.len() > depth {
                self.step(vm);
            }
            // The finalizer's result landed in this frame's register 0.
            let idx = self.reg_index(0);
            self.ensure_locals(idx + 1);
            self.locals[idx].drop_reg(&vm.program);
        }
        self.args = saved_args;
    }

    fn tailcall(&mut self, vm: &Arc<Vm>, func_id: u32) -> Result<(), ErrorKind> {
        let prog = &vm.program;
        let func = prog.function(func_id)?;
        let registers = func.registers;
        let entry = *func.labels.first().ok_or(ErrorKind::BadLabel)?;
        let params = func.param_types.clone();

        // The frame-local region survives a tailcall.
        self.teardown(vm, true);
        let n = self.check_args(&params, false, prog)?;

        let frame_id = self.fr().frame_id;
        let base = self.fr().base;
        let mut stack_escape = false;
        for i in 0..n {
            let idx = self.arg_index(i);
            self.ensure_locals(idx + 1);
            let v = self.locals[idx].take();
            if v.location() == frame_id {
                stack_escape = true;
            }
            self.ensure_locals(base + i + 1);
            self.locals[base + i] = v;
        }
        if stack_escape {
            return Err(ErrorKind::BadStackEscape);
        }

        self.ensure_locals(base + registers);
        let f = self.fr_mut();
        f.func = func_id;
        f.registers = registers;
        f.pc = entry;
        f.calltype = CallType::Call;
        f.finalize_top = f.finalize_base;
        Ok(())
    }

    fn branch(&mut self, label: u64, prog: &Program) -> Result<(), ErrorKind> {
        let func = prog.function(self.fr().func)?;
        let pc = *func
            .labels
            .get(label as usize)
            .ok_or(ErrorKind::BadLabel)?;
        self.fr_mut().pc = pc;
        Ok(())
    }

    fn trap(&self, kind: ErrorKind) -> Value {
        Value::Error(ErrorInfo {
            kind,
            func: self.current_func,
            pc: self.current_pc as u64,
        })
    }

    // The decode loop.

    fn step(&mut self, vm: &Arc<Vm>) {
        let (func, pc) = {
            let f = self.fr();
            (f.func, f.pc)
        };
        self.current_func = func;
        self.current_pc = pc;
        if let Err(kind) = self.step_inner(vm) {
            let v = self.trap(kind);
            self.popframe(vm, v, Condition::Throw);
        }
    }

    fn step_inner(&mut self, vm: &Arc<Vm>) -> Result<(), ErrorKind> {
        let prog = &vm.program;
        let mut cur = Cursor::new(&prog.code);
        cur.seek(self.fr().pc);

        let op = Op::try_from(uleb(&mut cur)? as u8).map_err(|_| ErrorKind::UnknownOpcode)?;
        trace!(func = self.current_func, pc = self.current_pc, ?op, "dispatch");

        match op {
            Op::Global => {
                let dst = uleb(&mut cur)?;
                let id = uleb(&mut cur)?;
                self.advance(&cur);
                let v = prog.global(id as u32)?.copy_reg();
                self.set_local(dst, v, prog);
            }

            Op::Const => {
                let dst = uleb(&mut cur)?;
                let t = ValueType::try_from(uleb(&mut cur)? as u8)
                    .map_err(|_| ErrorKind::UnknownPrimitiveType)?;
                let v = decode_const(&mut cur, t)?;
                self.advance(&cur);
                self.set_local(dst, v, prog);
            }

            Op::String => {
                let dst = uleb(&mut cur)?;
                let id = uleb(&mut cur)?;
                self.advance(&cur);
                let arr = prog.string(id as u32)?;
                self.set_local(dst, Value::Array(arr, false), prog);
            }

            Op::Convert => {
                let dst = uleb(&mut cur)?;
                let t = ValueType::try_from(uleb(&mut cur)? as u8)
                    .map_err(|_| ErrorKind::BadConversion)?;
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let v = self.local(src).convert(t)?;
                self.set_local(dst, v, prog);
            }

            Op::New => {
                let dst = uleb(&mut cur)?;
                let class_id = uleb(&mut cur)?;
                self.advance(&cur);
                let cls = prog.cls(class_id as u32)?;
                if let Some(singleton) = cls.singleton {
                    self.set_local(dst, Value::Object(singleton, false), prog);
                } else {
                    let n = self.check_field_args(cls, prog)?;
                    let region = self.fr().region;
                    let obj = unsafe { region.get().object(cls) };
                    self.init_object(obj, n, prog)?;
                    self.set_local(dst, Value::Object(obj, false), prog);
                }
            }

            Op::Stack => {
                let dst = uleb(&mut cur)?;
                let class_id = uleb(&mut cur)?;
                self.advance(&cur);
                let cls = prog.cls(class_id as u32)?;
                if let Some(singleton) = cls.singleton {
                    self.set_local(dst, Value::Object(singleton, false), prog);
                } else {
                    let n = self.check_field_args(cls, prog)?;
                    let frame_id = self.fr().frame_id;
                    let size = cls.size;
                    let mem = self.stack.alloc(size)?;
                    let obj = unsafe { ObjPtr::init_at(mem, cls, frame_id) };
                    if obj.finalizer(prog).is_some() {
                        self.finalize.push(obj);
                        self.fr_mut().finalize_top = self.finalize.len();
                    }
                    self.init_object(obj, n, prog)?;
                    self.set_local(dst, Value::Object(obj, false), prog);
                }
            }

            Op::Heap => {
                let dst = uleb(&mut cur)?;
                let region_reg = uleb(&mut cur)?;
                let class_id = uleb(&mut cur)?;
                self.advance(&cur);
                let region = self
                    .local(region_reg)
                    .region()
                    .ok_or(ErrorKind::BadAllocTarget)?;
                let cls = prog.cls(class_id as u32)?;
                if let Some(singleton) = cls.singleton {
                    self.set_local(dst, Value::Object(singleton, false), prog);
                } else {
                    let n = self.check_field_args(cls, prog)?;
                    let obj = unsafe { region.get().object(cls) };
                    self.init_object(obj, n, prog)?;
                    self.set_local(dst, Value::Object(obj, false), prog);
                }
            }

            Op::Region => {
                let dst = uleb(&mut cur)?;
                let kind = RegionType::try_from(uleb(&mut cur)? as u8)
                    .map_err(|_| ErrorKind::UnknownRegionType)?;
                let class_id = uleb(&mut cur)?;
                self.advance(&cur);
                let cls = prog.cls(class_id as u32)?;
                if cls.singleton.is_some() {
                    return Err(ErrorKind::BadRegionEntryPoint);
                }
                let n = self.check_field_args(cls, prog)?;
                let region = RegionPtr::alloc(kind);
                let obj = unsafe { region.get().object(cls) };
                self.init_object(obj, n, prog)?;
                self.set_local(dst, Value::Object(obj, false), prog);
            }

            Op::NewArray | Op::StackArray => {
                let dst = uleb(&mut cur)?;
                let size_reg = uleb(&mut cur)?;
                let type_id = TypeId::from_raw(uleb(&mut cur)? as u32);
                self.advance(&cur);
                let size = self.local(size_reg).index()?;
                let arr = self.alloc_array(op, None, type_id, size, prog)?;
                self.set_local(dst, Value::Array(arr, false), prog);
            }

            Op::NewArrayConst | Op::StackArrayConst => {
                let dst = uleb(&mut cur)?;
                let type_id = TypeId::from_raw(uleb(&mut cur)? as u32);
                let size = uleb(&mut cur)? as usize;
                self.advance(&cur);
                let arr = self.alloc_array(op, None, type_id, size, prog)?;
                self.set_local(dst, Value::Array(arr, false), prog);
            }

            Op::HeapArray => {
                let dst = uleb(&mut cur)?;
                let region_reg = uleb(&mut cur)?;
                let size_reg = uleb(&mut cur)?;
                let type_id = TypeId::from_raw(uleb(&mut cur)? as u32);
                self.advance(&cur);
                let region = self
                    .local(region_reg)
                    .region()
                    .ok_or(ErrorKind::BadAllocTarget)?;
                let size = self.local(size_reg).index()?;
                let arr = self.alloc_array(op, Some(region), type_id, size, prog)?;
                self.set_local(dst, Value::Array(arr, false), prog);
            }

            Op::HeapArrayConst => {
                let dst = uleb(&mut cur)?;
                let region_reg = uleb(&mut cur)?;
                let type_id = TypeId::from_raw(uleb(&mut cur)? as u32);
                let size = uleb(&mut cur)? as usize;
                self.advance(&cur);
                let region = self
                    .local(region_reg)
                    .region()
                    .ok_or(ErrorKind::BadAllocTarget)?;
                let arr = self.alloc_array(op, Some(region), type_id, size, prog)?;
                self.set_local(dst, Value::Array(arr, false), prog);
            }

            Op::RegionArray => {
                let dst = uleb(&mut cur)?;
                let kind = RegionType::try_from(uleb(&mut cur)? as u8)
                    .map_err(|_| ErrorKind::UnknownRegionType)?;
                let size_reg = uleb(&mut cur)?;
                let type_id = TypeId::from_raw(uleb(&mut cur)? as u32);
                self.advance(&cur);
                let size = self.local(size_reg).index()?;
                let region = RegionPtr::alloc(kind);
                let arr = unsafe { region.get().array(type_id, size, prog)? };
                self.set_local(dst, Value::Array(arr, false), prog);
            }

            Op::RegionArrayConst => {
                let dst = uleb(&mut cur)?;
                let kind = RegionType::try_from(uleb(&mut cur)? as u8)
                    .map_err(|_| ErrorKind::UnknownRegionType)?;
                let type_id = TypeId::from_raw(uleb(&mut cur)? as u32);
                let size = uleb(&mut cur)? as usize;
                self.advance(&cur);
                let region = RegionPtr::alloc(kind);
                let arr = unsafe { region.get().array(type_id, size, prog)? };
                self.set_local(dst, Value::Array(arr, false), prog);
            }

            Op::Copy => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let v = self.local(src).copy_reg();
                self.set_local(dst, v, prog);
            }

            Op::Move => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let v = self.local(src).take();
                self.set_local(dst, v, prog);
            }

            Op::Drop => {
                let dst = uleb(&mut cur)?;
                self.advance(&cur);
                self.local(dst).drop_reg(prog);
            }

            Op::RegisterRef => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let index = self.reg_index(src);
                let frame = self.fr().frame_id;
                self.set_local(dst, Value::RegisterRef { index, frame }, prog);
            }

            Op::FieldRefMove | Op::FieldRefCopy => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                let field = uleb(&mut cur)? as u32;
                self.advance(&cur);
                let is_move = op == Op::FieldRefMove;
                let v = self.local(src).ref_field(is_move, field, prog)?;
                self.set_local(dst, v, prog);
            }

            Op::ArrayRefMove | Op::ArrayRefCopy => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                let idx_reg = uleb(&mut cur)?;
                self.advance(&cur);
                let idx = self.local(idx_reg).index()?;
                let is_move = op == Op::ArrayRefMove;
                let v = self.local(src).ref_array(is_move, idx)?;
                self.set_local(dst, v, prog);
            }

            Op::ArrayRefMoveConst | Op::ArrayRefCopyConst => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                let idx = uleb(&mut cur)? as usize;
                self.advance(&cur);
                let is_move = op == Op::ArrayRefMoveConst;
                let v = self.local(src).ref_array(is_move, idx)?;
                self.set_local(dst, v, prog);
            }

            Op::Load => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let idx = self.reg_index(src);
                self.ensure_locals(idx + 1);
                let v = if let Value::RegisterRef { index, .. } = self.locals[idx] {
                    self.ensure_locals(index + 1);
                    self.locals[index].copy_reg()
                } else {
                    self.locals[idx].load(prog)?
                };
                self.set_local(dst, v, prog);
            }

            Op::StoreMove | Op::StoreCopy => {
                let dst = uleb(&mut cur)?;
                let ref_reg = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let is_move = op == Op::StoreMove;
                let prev = self.store_through(ref_reg, src, is_move, prog)?;
                self.set_local(dst, prev, prog);
            }

            Op::LookupStatic => {
                let dst = uleb(&mut cur)?;
                let func_id = uleb(&mut cur)? as u32;
                self.advance(&cur);
                prog.function(func_id)?;
                self.set_local(dst, Value::Function(func_id), prog);
            }

            Op::LookupDynamic => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                let method = uleb(&mut cur)? as u32;
                self.advance(&cur);
                let func = self.local(src).method(method, prog)?;
                self.set_local(dst, Value::Function(func), prog);
            }

            Op::LookupFFI => {
                let dst = uleb(&mut cur)?;
                let symbol_id = uleb(&mut cur)? as u32;
                self.advance(&cur);
                let ptr = prog.symbol(symbol_id)?.raw_pointer();
                self.set_local(dst, Value::Ptr(ptr), prog);
            }

            Op::ArgMove => {
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let v = self.local(src).take();
                self.stage_arg(v, prog);
            }

            Op::ArgCopy => {
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let v = self.local(src).copy_reg();
                self.stage_arg(v, prog);
            }

            Op::CallStatic | Op::SubcallStatic | Op::TryStatic => {
                let dst = uleb(&mut cur)?;
                let func_id = uleb(&mut cur)? as u32;
                self.advance(&cur);
                self.pushframe(vm, func_id, dst, call_discipline(op))?;
            }

            Op::CallDynamic | Op::SubcallDynamic | Op::TryDynamic => {
                let dst = uleb(&mut cur)?;
                let func_reg = uleb(&mut cur)?;
                self.advance(&cur);
                let func = self
                    .local(func_reg)
                    .function()
                    .ok_or(ErrorKind::MethodNotFound)?;
                self.pushframe(vm, func, dst, call_discipline(op))?;
            }

            Op::Ffi => {
                let dst = uleb(&mut cur)?;
                let symbol_id = uleb(&mut cur)? as u32;
                self.advance(&cur);
                self.ffi_call(vm, dst, symbol_id)?;
            }

            Op::WhenStatic => {
                let dst = uleb(&mut cur)?;
                let type_id = TypeId::from_raw(uleb(&mut cur)? as u32);
                let func_id = uleb(&mut cur)? as u32;
                self.advance(&cur);
                self.queue_behavior(vm, dst, type_id, func_id)?;
            }

            Op::WhenDynamic => {
                let dst = uleb(&mut cur)?;
                let type_id = TypeId::from_raw(uleb(&mut cur)? as u32);
                let func_reg = uleb(&mut cur)?;
                self.advance(&cur);
                let func = self
                    .local(func_reg)
                    .function()
                    .ok_or(ErrorKind::MethodNotFound)?;
                self.queue_behavior(vm, dst, type_id, func)?;
            }

            Op::Typetest => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                let type_id = TypeId::from_raw(uleb(&mut cur)? as u32);
                self.advance(&cur);
                let idx = self.reg_index(src);
                self.ensure_locals(idx + 1);
                let tid = self.value_type_id(&self.locals[idx], prog);
                self.set_local(dst, Value::Bool(prog.subtype(tid, type_id)), prog);
            }

            Op::Freeze => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let idx = self.reg_index(src);
                self.ensure_locals(idx + 1);
                freeze(&self.locals[idx], prog)?;
                let v = self.locals[idx].take();
                self.set_local(dst, v, prog);
            }

            Op::TailcallStatic => {
                let func_id = uleb(&mut cur)? as u32;
                self.advance(&cur);
                self.tailcall(vm, func_id)?;
            }

            Op::TailcallDynamic => {
                let func_reg = uleb(&mut cur)?;
                self.advance(&cur);
                let func = self
                    .local(func_reg)
                    .function()
                    .ok_or(ErrorKind::MethodNotFound)?;
                self.tailcall(vm, func)?;
            }

            Op::Return | Op::Raise | Op::Throw => {
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let ret = self.local(src).take();
                let condition = match op {
                    Op::Return => Condition::Return,
                    Op::Raise => Condition::Raise,
                    _ => Condition::Throw,
                };
                self.popframe(vm, ret, condition);
            }

            Op::Cond => {
                let cond_reg = uleb(&mut cur)?;
                let on_true = uleb(&mut cur)?;
                let on_false = uleb(&mut cur)?;
                self.advance(&cur);
                let cond = self.local(cond_reg).get_bool()?;
                self.branch(if cond { on_true } else { on_false }, prog)?;
            }

            Op::Jump => {
                let target = uleb(&mut cur)?;
                self.advance(&cur);
                self.branch(target, prog)?;
            }

            Op::Add => self.binop(&mut cur, prog, Value::op_add)?,
            Op::Sub => self.binop(&mut cur, prog, Value::op_sub)?,
            Op::Mul => self.binop(&mut cur, prog, Value::op_mul)?,
            Op::Div => self.binop(&mut cur, prog, Value::op_div)?,
            Op::Mod => self.binop(&mut cur, prog, Value::op_mod)?,
            Op::Pow => self.binop(&mut cur, prog, Value::op_pow)?,
            Op::And => self.binop(&mut cur, prog, Value::op_and)?,
            Op::Or => self.binop(&mut cur, prog, Value::op_or)?,
            Op::Xor => self.binop(&mut cur, prog, Value::op_xor)?,
            Op::Shl => self.binop(&mut cur, prog, Value::op_shl)?,
            Op::Shr => self.binop(&mut cur, prog, Value::op_shr)?,
            Op::Eq => self.binop(&mut cur, prog, Value::op_eq)?,
            Op::Ne => self.binop(&mut cur, prog, Value::op_ne)?,
            Op::Lt => self.binop(&mut cur, prog, Value::op_lt)?,
            Op::Le => self.binop(&mut cur, prog, Value::op_le)?,
            Op::Gt => self.binop(&mut cur, prog, Value::op_gt)?,
            Op::Ge => self.binop(&mut cur, prog, Value::op_ge)?,
            Op::Min => self.binop(&mut cur, prog, Value::op_min)?,
            Op::Max => self.binop(&mut cur, prog, Value::op_max)?,
            Op::LogBase => self.binop(&mut cur, prog, Value::op_logbase)?,
            Op::Atan2 => self.binop(&mut cur, prog, Value::op_atan2)?,

            Op::Neg => self.unop(&mut cur, prog, Value::op_neg)?,
            Op::Not => self.unop(&mut cur, prog, Value::op_not)?,
            Op::Abs => self.unop(&mut cur, prog, Value::op_abs)?,
            Op::Ceil => self.unop(&mut cur, prog, Value::op_ceil)?,
            Op::Floor => self.unop(&mut cur, prog, Value::op_floor)?,
            Op::Exp => self.unop(&mut cur, prog, Value::op_exp)?,
            Op::Log => self.unop(&mut cur, prog, Value::op_log)?,
            Op::Sqrt => self.unop(&mut cur, prog, Value::op_sqrt)?,
            Op::Cbrt => self.unop(&mut cur, prog, Value::op_cbrt)?,
            Op::IsInf => self.unop(&mut cur, prog, Value::op_isinf)?,
            Op::IsNaN => self.unop(&mut cur, prog, Value::op_isnan)?,
            Op::Sin => self.unop(&mut cur, prog, Value::op_sin)?,
            Op::Cos => self.unop(&mut cur, prog, Value::op_cos)?,
            Op::Tan => self.unop(&mut cur, prog, Value::op_tan)?,
            Op::Asin => self.unop(&mut cur, prog, Value::op_asin)?,
            Op::Acos => self.unop(&mut cur, prog, Value::op_acos)?,
            Op::Atan => self.unop(&mut cur, prog, Value::op_atan)?,
            Op::Sinh => self.unop(&mut cur, prog, Value::op_sinh)?,
            Op::Cosh => self.unop(&mut cur, prog, Value::op_cosh)?,
            Op::Tanh => self.unop(&mut cur, prog, Value::op_tanh)?,
            Op::Asinh => self.unop(&mut cur, prog, Value::op_asinh)?,
            Op::Acosh => self.unop(&mut cur, prog, Value::op_acosh)?,
            Op::Atanh => self.unop(&mut cur, prog, Value::op_atanh)?,
            Op::Bits => self.unop(&mut cur, prog, Value::op_bits)?,
            Op::Len => self.unop(&mut cur, prog, Value::op_len)?,
            Op::Read => self.unop(&mut cur, prog, Value::op_read)?,

            Op::Ptr => {
                let dst = uleb(&mut cur)?;
                let src = uleb(&mut cur)?;
                self.advance(&cur);
                let v = self.local(src).op_ptr()?;
                self.set_local(dst, v, prog);
            }

            Op::ConstE => self.nullop(&mut cur, prog, Value::op_e)?,
            Op::ConstPi => self.nullop(&mut cur, prog, Value::op_pi)?,
            Op::ConstInf => self.nullop(&mut cur, prog, Value::op_inf)?,
            Op::ConstNan => self.nullop(&mut cur, prog, Value::op_nan)?,
        }

        Ok(())
    }

    /// Record the cursor position as the frame's next pc; branches and
    /// calls overwrite it afterwards.
    fn advance(&mut self, cur: &Cursor<'_>) {
        self.fr_mut().pc = cur.pos();
    }

    fn binop(
        &mut self,
        cur: &mut Cursor<'_>,
        prog: &Program,
        f: fn(&Value, &Value) -> Result<Value, ErrorKind>,
    ) -> Result<(), ErrorKind> {
        let dst = uleb(cur)?;
        let lhs = uleb(cur)?;
        let rhs = uleb(cur)?;
        self.advance(cur);
        let l = self.reg_index(lhs);
        let r = self.reg_index(rhs);
        self.ensure_locals(l.max(r) + 1);
        let v = f(&self.locals[l], &self.locals[r])?;
        self.set_local(dst, v, prog);
        Ok(())
    }

    fn unop(
        &mut self,
        cur: &mut Cursor<'_>,
        prog: &Program,
        f: fn(&Value) -> Result<Value, ErrorKind>,
    ) -> Result<(), ErrorKind> {
        let dst = uleb(cur)?;
        let src = uleb(cur)?;
        self.advance(cur);
        let v = f(self.local(src))?;
        self.set_local(dst, v, prog);
        Ok(())
    }

    fn nullop(
        &mut self,
        cur: &mut Cursor<'_>,
        prog: &Program,
        f: fn() -> Value,
    ) -> Result<(), ErrorKind> {
        let dst = uleb(cur)?;
        self.advance(cur);
        self.set_local(dst, f(), prog);
        Ok(())
    }

    fn alloc_array(
        &mut self,
        op: Op,
        region: Option<RegionPtr>,
        type_id: TypeId,
        size: usize,
        prog: &Program,
    ) -> Result<crate::array::ArrPtr, ErrorKind> {
        match op {
            Op::NewArray | Op::NewArrayConst => {
                let region = self.fr().region;
                unsafe { region.get().array(type_id, size, prog) }
            }
            Op::StackArray | Op::StackArrayConst => {
                let frame_id = self.fr().frame_id;
                self.stack.array(frame_id, type_id, size, prog)
            }
            _ => {
                let region = region.expect("heap array without a region");
                unsafe { region.get().array(type_id, size, prog) }
            }
        }
    }

    fn store_through(
        &mut self,
        ref_reg: u64,
        src_reg: u64,
        is_move: bool,
        prog: &Program,
    ) -> Result<Value, ErrorKind> {
        let ref_idx = self.reg_index(ref_reg);
        let src_idx = self.reg_index(src_reg);
        self.ensure_locals(ref_idx.max(src_idx) + 1);

        if let Value::RegisterRef { index, frame } = self.locals[ref_idx] {
            // Stores through register refs keep frame ordering honest: the
            // stored value must not be pinned to a younger frame.
            let vloc = self.locals[src_idx].location();
            if let Some(vf) = vloc.frame_index() {
                if vf > frame.stack_index() {
                    return Err(ErrorKind::BadStoreTarget);
                }
            }
            if self.locals[src_idx].is_readonly() {
                return Err(ErrorKind::BadStore);
            }
            let v = if is_move {
                self.locals[src_idx].take()
            } else {
                self.locals[src_idx].copy_reg()
            };
            self.ensure_locals(index + 1);
            let prev = std::mem::replace(&mut self.locals[index], v);
            return Ok(prev);
        }

        // Split the borrow: the reference value is read-only during the
        // store, the source is consumed or copied.
        let refv = self.locals[ref_idx].copy_reg();
        let result = {
            let src = unsafe { &mut *(&mut self.locals[src_idx] as *mut Value) };
            refv.store(is_move, src, prog)
        };
        let mut refv = refv;
        refv.drop_reg(prog);
        result
    }

    // FFI.

    fn ffi_call(&mut self, vm: &Arc<Vm>, dst: u64, symbol_id: u32) -> Result<(), ErrorKind> {
        let prog = &vm.program;
        let symbol = prog.symbol(symbol_id)?;
        let declared = symbol.params().len();
        let vararg = symbol.is_vararg();
        let params = symbol.params().to_vec();
        let num_args = {
            // Arity plus subtype gate over the declared prefix.
            let n = self.args;
            if n < declared || (!vararg && n > declared) {
                self.drop_args(prog);
                return Err(ErrorKind::BadArgs);
            }
            for (i, param) in params.iter().enumerate() {
                let idx = self.arg_index(i);
                self.ensure_locals(idx + 1);
                let tid = self.value_type_id(&self.locals[idx], prog);
                if !prog.subtype(tid, *param) {
                    self.drop_args(prog);
                    return Err(ErrorKind::BadType);
                }
            }
            self.args = 0;
            n
        };

        // Pin every argument slot before taking addresses; growing the
        // register vector mid-binding would invalidate them.
        self.ensure_locals(self.arg_index(num_args) + 1);
        let mut addrs: Vec<*mut c_void> = Vec::with_capacity(num_args);
        let mut scratch: Vec<u64> = vec![0; num_args];
        let mut var_types = Vec::new();

        for i in 0..num_args {
            let idx = self.arg_index(i);
            let expected = if i < declared {
                symbol.param_vals()[i]
            } else {
                let tid = self.value_type_id(&self.locals[idx], prog);
                let (vt, ffi, _stride) = prog.layout_type_id(tid)?;
                var_types.push(if vt == ValueType::Invalid {
                    unsafe { std::ptr::addr_of_mut!(libffi::low::types::pointer) }
                } else {
                    ffi
                });
                vt
            };

            let arg = &mut self.locals[idx] as *mut Value;
            let addr = match expected {
                ValueType::Invalid => arg as *mut c_void,
                ValueType::Object => {
                    if let Value::Object(obj, _) = unsafe { &*arg } {
                        scratch[i] = obj.fields_ptr() as u64;
                    }
                    &mut scratch[i] as *mut u64 as *mut c_void
                }
                ValueType::Array => {
                    if let Value::Array(arr, _) = unsafe { &*arg } {
                        scratch[i] = arr.elems_ptr() as u64;
                    }
                    &mut scratch[i] as *mut u64 as *mut c_void
                }
                ValueType::Cown => {
                    if let Value::Cown { cown, .. } = unsafe { &*arg } {
                        scratch[i] = cown.as_raw() as u64;
                    }
                    &mut scratch[i] as *mut u64 as *mut c_void
                }
                _ => unsafe { (*arg).ffi_addr()? },
            };
            addrs.push(addr);
        }

        let raw = symbol.call(&mut addrs, &var_types)?;
        let ret = Value::from_ffi(symbol.ret_val(), raw);
        let bad_return =
            !ret.is_error() && !prog.subtype(self.value_type_id(&ret, prog), symbol.ret());
        if !bad_return {
            self.set_local(dst, ret, prog);
        }
        for i in 0..num_args {
            let idx = self.arg_index(i);
            self.locals[idx].drop_reg(prog);
        }
        if bad_return {
            return Err(ErrorKind::BadType);
        }
        Ok(())
    }

    // Behaviours.

    fn queue_behavior(
        &mut self,
        vm: &Arc<Vm>,
        dst: u64,
        type_id: TypeId,
        func_id: u32,
    ) -> Result<(), ErrorKind> {
        let prog = &vm.program;
        let func = prog.function(func_id)?;
        let params = func.param_types.clone();
        let return_type = func.return_type;

        if params.len() != self.args {
            self.drop_args(prog);
            return Err(ErrorKind::BadArgs);
        }
        let n = self.args;

        // A non-cown first argument is sendable closure state.
        let mut first_cown = 0;
        if n > 0 {
            let idx = self.arg_index(0);
            self.ensure_locals(idx + 1);
            if !self.locals[idx].is_cown() {
                let tid = self.value_type_id(&self.locals[idx], prog);
                if !prog.subtype(tid, params[0]) || !self.locals[idx].is_sendable() {
                    self.drop_args(prog);
                    return Err(ErrorKind::BadArgs);
                }
                first_cown = 1;
            }
        }

        // Every other argument is a cown whose ref type must match.
        for i in first_cown..n {
            let idx = self.arg_index(i);
            self.ensure_locals(idx + 1);
            let Ok(cown) = self.locals[idx].cown() else {
                self.drop_args(prog);
                return Err(ErrorKind::BadArgs);
            };
            if !prog.subtype(cown.content_type_id().ref_of(), params[i]) {
                self.drop_args(prog);
                return Err(ErrorKind::BadArgs);
            }
        }

        let result = match CownPtr::create(type_id, vm.program.clone()) {
            Ok(result) => result,
            Err(e) => {
                self.drop_args(prog);
                return Err(e);
            }
        };
        if !prog.subtype(return_type, result.content_type_id()) {
            self.drop_args(prog);
            result.dec(prog);
            return Err(ErrorKind::BadType);
        }

        // Commit: take ownership of the staged arguments.
        let mut closure = Value::Invalid;
        if first_cown == 1 {
            let idx = self.arg_index(0);
            closure = self.locals[idx].take();
            if let Some(r) = closure.region() {
                // The behaviour owns the region until it runs.
                unsafe { r.get().set_captured(true) };
            }
        }

        let mut cown_vals = Vec::with_capacity(n - first_cown);
        let mut slots = Vec::with_capacity(n - first_cown + 1);
        // The behaviour holds its result cown as a writer, so anything
        // scheduled against the result is ordered after the write.
        slots.push(Slot {
            cown: result.queue(),
            read_only: false,
        });
        for i in first_cown..n {
            let idx = self.arg_index(i);
            let v = self.locals[idx].take();
            let cown = v.cown().expect("checked above");
            slots.push(Slot {
                cown: cown.queue(),
                read_only: v.is_readonly(),
            });
            cown_vals.push(v);
        }
        self.args = 0;

        // The behaviour holds its own reference to the result cown.
        result.inc();
        self.set_local(
            dst,
            Value::Cown {
                cown: result,
                readonly: false,
            },
            prog,
        );

        let vm = vm.clone();
        vm.scheduler.clone().schedule_behavior(
            slots,
            Box::new(move || {
                Thread::with(|t| t.run_behavior(&vm, func_id, closure, cown_vals, result));
            }),
        );
        Ok(())
    }

    fn run_behavior(
        &mut self,
        vm: &Arc<Vm>,
        func: u32,
        closure: Value,
        cown_vals: Vec<Value>,
        result: CownPtr,
    ) {
        debug_assert!(self.frames.is_empty());
        debug_assert_eq!(self.args, 0);
        let prog = &vm.program;

        if !closure.is_invalid() {
            // The closure region is released to the behaviour body.
            if let Some(r) = closure.region() {
                unsafe { r.get().set_captured(false) };
            }
            self.stage_arg(closure, prog);
        }

        for v in &cown_vals {
            let cown = v.cown().expect("behaviour argument is a cown");
            cown.inc();
            self.stage_arg(
                Value::CownRef {
                    cown,
                    readonly: v.is_readonly(),
                },
                prog,
            );
        }

        let mut ret = self.thread_run(vm, func);
        match result.store(true, &mut ret, prog) {
            Ok(mut prev) => prev.drop_reg(prog),
            Err(kind) => {
                let mut e = Value::Error(ErrorInfo::hostside(kind));
                if let Ok(mut prev) = result.store(true, &mut e, prog) {
                    prev.drop_reg(prog);
                }
                ret.drop_reg(prog);
            }
        }
        result.dec(prog);

        for mut v in cown_vals {
            v.drop_reg(prog);
        }
    }

    #[cfg(test)]
    pub(crate) fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

fn call_discipline(op: Op) -> CallType {
    match op {
        Op::CallStatic | Op::CallDynamic => CallType::Call,
        Op::SubcallStatic | Op::SubcallDynamic => CallType::Subcall,
        _ => CallType::Catch,
    }
}

fn uleb(cur: &mut Cursor<'_>) -> Result<u64, ErrorKind> {
    cur.uleb().map_err(|_| ErrorKind::UnknownOpcode)
}

fn sleb(cur: &mut Cursor<'_>) -> Result<i64, ErrorKind> {
    cur.sleb().map_err(|_| ErrorKind::UnknownOpcode)
}

fn decode_const(cur: &mut Cursor<'_>, t: ValueType) -> Result<Value, ErrorKind> {
    Ok(match t {
        ValueType::None => Value::None,
        ValueType::Bool => Value::Bool(uleb(cur)? != 0),
        ValueType::I8 => Value::I8(sleb(cur)? as i8),
        ValueType::I16 => Value::I16(sleb(cur)? as i16),
        ValueType::I32 => Value::I32(sleb(cur)? as i32),
        ValueType::I64 => Value::I64(sleb(cur)?),
        ValueType::ILong => Value::ILong(sleb(cur)?),
        ValueType::ISize => Value::ISize(sleb(cur)? as isize),
        ValueType::U8 => Value::U8(uleb(cur)? as u8),
        ValueType::U16 => Value::U16(uleb(cur)? as u16),
        ValueType::U32 => Value::U32(uleb(cur)? as u32),
        ValueType::U64 => Value::U64(uleb(cur)?),
        ValueType::ULong => Value::ULong(uleb(cur)?),
        ValueType::USize => Value::USize(uleb(cur)? as usize),
        // Float literals travel as raw bits.
        ValueType::F32 => Value::F32(f32::from_bits(uleb(cur)? as u32)),
        ValueType::F64 => Value::F64(f64::from_bits(uleb(cur)?)),
        _ => return Err(ErrorKind::BadConversion),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbci_bytecode::BytecodeBuilder;

    fn i32_t() -> TypeId {
        TypeId::prim(ValueType::I32)
    }

    fn countdown_program() -> (Arc<Vm>, u32) {
        let mut b = BytecodeBuilder::new();
        let main = b.declare_function(&[], i32_t(), 1);
        b.label(main);
        b.const_i32(0, 0);
        b.op(Op::Return).u(0);

        // loop(n) = if n == 0 { 0 } else { loop(n - 1) }
        let looper = b.declare_function(&[i32_t()], i32_t(), 4);
        b.label(looper);
        b.const_i32(1, 0);
        b.op(Op::Eq).u(2).u(0).u(1);
        b.op(Op::Cond).u(2).u(1).u(2);
        b.label(looper);
        b.const_i32(3, 0);
        b.op(Op::Return).u(3);
        b.label(looper);
        b.const_i32(1, 1);
        b.op(Op::Sub).u(2).u(0).u(1);
        b.op(Op::ArgMove).u(2);
        b.op(Op::TailcallStatic).u(looper as u64);

        let program =
            crate::loader::parse(std::path::Path::new("<unit>"), &b.finish()).unwrap();
        (Vm::with_program(program), looper)
    }

    #[test]
    fn tailcalls_never_grow_the_frame_stack() {
        let (vm, looper) = countdown_program();
        Thread::with(|t| {
            t.stage_arg(Value::I32(10_000), &vm.program);
            t.pushframe(&vm, looper, 0, CallType::Catch).unwrap();
            let mut max_frames = 0;
            while t.frame_count() > 0 {
                max_frames = max_frames.max(t.frame_count());
                t.step(&vm);
            }
            assert_eq!(max_frames, 1);
            assert!(matches!(t.locals[0].take(), Value::I32(0)));
        });
        vm.io.stop();
    }

    #[test]
    fn tailcalling_with_a_stack_argument_traps() {
        let mut b = BytecodeBuilder::new();
        let cell = b.add_class(&[(0, i32_t())], &[]);
        let main = b.declare_function(&[], i32_t(), 4);
        let target = b.declare_function(&[TypeId::DYN], i32_t(), 2);

        b.label(main);
        b.const_i32(0, 1);
        b.op(Op::ArgMove).u(0);
        b.op(Op::Stack).u(1).ty(cell);
        b.op(Op::ArgMove).u(1);
        b.op(Op::TailcallStatic).u(target as u64);

        b.label(target);
        b.const_i32(1, 0);
        b.op(Op::Return).u(1);

        let program =
            crate::loader::parse(std::path::Path::new("<unit>"), &b.finish()).unwrap();
        let vm = Vm::with_program(program);
        let ret = Thread::with(|t| t.thread_run(&vm, vbci_bytecode::MAIN_FUNC_ID));
        assert!(
            matches!(ret, Value::Error(info) if info.kind == ErrorKind::BadStackEscape),
            "expected a stack escape trap"
        );
        vm.io.stop();
    }
}
