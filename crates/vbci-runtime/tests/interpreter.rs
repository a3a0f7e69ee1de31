// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end interpreter scenarios over literal bytecode programs.

use std::path::Path;

use vbci_bytecode::{BytecodeBuilder, Op, RegionType, TypeId, ValueType};
use vbci_runtime::{loader, Thread, Vm};

fn i32_t() -> TypeId {
    TypeId::prim(ValueType::I32)
}

fn build_vm(b: &BytecodeBuilder) -> std::sync::Arc<Vm> {
    let program = loader::parse(Path::new("<test>"), &b.finish()).expect("program parses");
    Vm::with_program(program)
}

#[test]
fn arithmetic_and_return() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 3);
    b.label(main);
    b.const_i32(0, 3);
    b.const_i32(1, 4);
    b.op(Op::Add).u(2).u(0).u(1);
    b.op(Op::Return).u(2);

    assert_eq!(build_vm(&b).run(), 7);
}

#[test]
fn object_construction_and_field_read() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 4);
    let point = b.add_class(&[(0, i32_t()), (1, i32_t())], &[]);
    b.label(main);
    b.const_i32(0, 10);
    b.const_i32(1, 20);
    b.op(Op::ArgMove).u(0);
    b.op(Op::ArgMove).u(1);
    b.op(Op::Region).u(2).u(RegionType::Rc as u64).ty(point);
    b.op(Op::FieldRefCopy).u(3).u(2).u(0);
    b.op(Op::Load).u(0).u(3);
    b.op(Op::Return).u(0);

    assert_eq!(build_vm(&b).run(), 10);
}

#[test]
fn heap_allocation_into_an_existing_region() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 5);
    let cell = b.add_class(&[(7, i32_t())], &[]);
    b.label(main);
    // One region, two objects in it; read back the second one's field.
    b.const_i32(0, 1);
    b.op(Op::ArgMove).u(0);
    b.op(Op::Region).u(1).u(RegionType::Rc as u64).ty(cell);
    b.const_i32(0, 42);
    b.op(Op::ArgMove).u(0);
    b.op(Op::Heap).u(2).u(1).ty(cell);
    b.op(Op::FieldRefCopy).u(3).u(2).u(7);
    b.op(Op::Load).u(4).u(3);
    b.op(Op::Return).u(4);

    assert_eq!(build_vm(&b).run(), 42);
}

#[test]
fn tailcall_loop_terminates() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 2);
    let looper = b.declare_function(&[i32_t()], i32_t(), 4);

    b.label(main);
    b.const_i32(0, 1_000_000);
    b.op(Op::ArgMove).u(0);
    b.op(Op::CallStatic).u(1).u(looper as u64);
    b.op(Op::Return).u(1);

    // loop(n) = if n == 0 { 0 } else { loop(n - 1) }
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

    assert_eq!(build_vm(&b).run(), 0);
}

#[test]
fn try_catches_a_thrown_bounds_error() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 3);
    let danger = b.declare_function(&[], i32_t(), 3);
    let u8_array = TypeId::prim(ValueType::U8).array_of();

    b.label(main);
    b.op(Op::TryStatic).u(0).u(danger as u64);
    b.op(Op::Typetest).u(1).u(0).ty(i32_t());
    b.op(Op::Cond).u(1).u(1).u(2);
    b.label(main); // normal completion: no throw observed
    b.const_i32(2, 0);
    b.op(Op::Return).u(2);
    b.label(main); // the thrown error is not an i32
    b.const_i32(2, 1);
    b.op(Op::Return).u(2);

    // Reading index 5 of a length-3 array throws BadArrayIndex.
    b.label(danger);
    b.op(Op::StackArrayConst).u(0).ty(u8_array).u(3);
    b.op(Op::ArrayRefCopyConst).u(1).u(0).u(5);
    b.const_i32(2, 0);
    b.op(Op::Return).u(2);

    assert_eq!(build_vm(&b).run(), 1);
}

#[test]
fn call_unwraps_a_raise_to_a_return() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 2);
    let raiser = b.declare_function(&[], i32_t(), 2);

    b.label(main);
    b.op(Op::CallStatic).u(0).u(raiser as u64);
    b.op(Op::Return).u(0);

    b.label(raiser);
    b.const_i32(0, 42);
    b.op(Op::Raise).u(0);

    assert_eq!(build_vm(&b).run(), 42);
}

#[test]
fn subcall_propagates_a_raise_to_the_outer_caller() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 2);
    let middle = b.declare_function(&[], i32_t(), 2);
    let raiser = b.declare_function(&[], i32_t(), 2);

    // main calls middle; middle subcalls raiser. The raise passes through
    // middle without unwrapping and lands in main as a plain return.
    b.label(main);
    b.op(Op::CallStatic).u(0).u(middle as u64);
    b.op(Op::Return).u(0);

    b.label(middle);
    b.op(Op::SubcallStatic).u(0).u(raiser as u64);
    // Not reached: the raise unwinds through the subcall.
    b.const_i32(1, 7);
    b.op(Op::Return).u(1);

    b.label(raiser);
    b.const_i32(0, 42);
    b.op(Op::Raise).u(0);

    assert_eq!(build_vm(&b).run(), 42);
}

#[test]
fn returning_a_stack_allocation_traps() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 3);
    let escapee = b.declare_function(&[], TypeId::DYN, 3);
    let cell = b.add_class(&[(0, i32_t())], &[]);

    b.label(main);
    b.op(Op::TryStatic).u(0).u(escapee as u64);
    b.op(Op::Typetest).u(1).u(0).ty(cell);
    b.op(Op::Cond).u(1).u(1).u(2);
    b.label(main); // impossible: the allocation escaped
    b.const_i32(2, 0);
    b.op(Op::Return).u(2);
    b.label(main); // the escape trapped
    b.const_i32(2, 1);
    b.op(Op::Return).u(2);

    b.label(escapee);
    b.const_i32(0, 5);
    b.op(Op::ArgMove).u(0);
    b.op(Op::Stack).u(1).ty(cell);
    b.op(Op::Return).u(1);

    assert_eq!(build_vm(&b).run(), 1);
}

#[test]
fn frame_local_return_drags_into_the_caller() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 4);
    let maker = b.declare_function(&[], TypeId::DYN, 2);
    let cell = b.add_class(&[(0, i32_t())], &[]);

    b.label(main);
    b.op(Op::CallStatic).u(0).u(maker as u64);
    b.op(Op::FieldRefCopy).u(1).u(0).u(0);
    b.op(Op::Load).u(2).u(1);
    b.op(Op::Return).u(2);

    // The frame-local allocation survives the return by dragging.
    b.label(maker);
    b.const_i32(0, 10);
    b.op(Op::ArgMove).u(0);
    b.op(Op::New).u(1).ty(cell);
    b.op(Op::Return).u(1);

    assert_eq!(build_vm(&b).run(), 10);
}

#[test]
fn storing_a_stack_value_into_a_region_traps() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 3);
    let violate = b.declare_function(&[], i32_t(), 5);
    let holder = b.add_class(&[(0, TypeId::DYN)], &[]);
    let cell = b.add_class(&[(1, i32_t())], &[]);

    b.label(main);
    b.op(Op::TryStatic).u(0).u(violate as u64);
    b.op(Op::Typetest).u(1).u(0).ty(i32_t());
    b.op(Op::Cond).u(1).u(1).u(2);
    b.label(main);
    b.const_i32(2, 0);
    b.op(Op::Return).u(2);
    b.label(main);
    b.const_i32(2, 1);
    b.op(Op::Return).u(2);

    b.label(violate);
    b.op(Op::Const).u(0).vt(ValueType::None);
    b.op(Op::ArgMove).u(0);
    b.op(Op::Region).u(1).u(RegionType::Rc as u64).ty(holder);
    b.const_i32(0, 9);
    b.op(Op::ArgMove).u(0);
    b.op(Op::Stack).u(2).ty(cell);
    b.op(Op::FieldRefCopy).u(3).u(1).u(0);
    b.op(Op::StoreMove).u(4).u(3).u(2);
    b.const_i32(0, 0);
    b.op(Op::Return).u(0);

    // The store violates "no stack values in regions" and traps.
    assert_eq!(build_vm(&b).run(), 1);
}

#[test]
fn when_behaviours_are_fifo_per_cown() {
    let mut b = BytecodeBuilder::new();
    let cown_i32 = i32_t().cown_of();
    let ref_i32 = i32_t().ref_of();
    let main = b.declare_function(&[], cown_i32, 4);
    let init = b.declare_function(&[], i32_t(), 2);
    let incr = b.declare_function(&[ref_i32], i32_t(), 4);

    b.label(main);
    // C starts life as the result cown of the init behaviour.
    b.op(Op::WhenStatic).u(0).ty(i32_t()).u(init as u64);
    b.op(Op::ArgCopy).u(0);
    b.op(Op::WhenStatic).u(1).ty(i32_t()).u(incr as u64);
    b.op(Op::ArgCopy).u(0);
    b.op(Op::WhenStatic).u(2).ty(i32_t()).u(incr as u64);
    b.op(Op::Return).u(0);

    b.label(init);
    b.const_i32(0, 1);
    b.op(Op::Return).u(0);

    // incr(c: ref i32) observes the previous write and adds one.
    b.label(incr);
    b.op(Op::Load).u(1).u(0);
    b.const_i32(2, 1);
    b.op(Op::Add).u(3).u(1).u(2);
    b.op(Op::StoreCopy).u(1).u(0).u(3);
    b.op(Op::Return).u(3);

    let vm = build_vm(&b);
    let mut ret = Thread::run_main(&vm);
    vm.scheduler.wait_idle();

    let cown = ret.cown().expect("main returns the cown");
    let mut content = cown.load();
    assert!(
        matches!(content, vbci_runtime::Value::I32(3)),
        "expected 3, got {content}"
    );
    content.drop_reg(&vm.program);
    ret.drop_reg(&vm.program);
    vm.io.stop();
}

#[test]
fn freeze_then_share_with_a_behaviour() {
    let mut b = BytecodeBuilder::new();
    let cown_i32 = i32_t().cown_of();
    let q = b.add_class(&[(0, i32_t())], &[]);
    let main = b.declare_function(&[], cown_i32, 4);
    let reader = b.declare_function(&[q], i32_t(), 4);

    b.label(main);
    b.const_i32(0, 10);
    b.op(Op::ArgMove).u(0);
    b.op(Op::Region).u(1).u(RegionType::Rc as u64).ty(q);
    b.op(Op::Freeze).u(2).u(1);
    b.op(Op::ArgMove).u(2);
    b.op(Op::WhenStatic).u(3).ty(i32_t()).u(reader as u64);
    b.op(Op::Return).u(3);

    // The behaviour reads a field of the (now immutable) closure object.
    b.label(reader);
    b.op(Op::FieldRefCopy).u(1).u(0).u(0);
    b.op(Op::Load).u(2).u(1);
    b.op(Op::Return).u(2);

    let vm = build_vm(&b);
    let mut ret = Thread::run_main(&vm);
    vm.scheduler.wait_idle();

    let cown = ret.cown().expect("main returns the result cown");
    let mut content = cown.load();
    assert!(
        matches!(content, vbci_runtime::Value::I32(10)),
        "expected 10, got {content}"
    );
    content.drop_reg(&vm.program);
    ret.drop_reg(&vm.program);
    vm.io.stop();
}

#[test]
fn ffi_calls_a_host_symbol() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 2);
    let lib = b.add_lib(None);
    let abs = b.add_symbol(lib, "abs", None, &[i32_t()], i32_t(), false);

    b.label(main);
    b.const_i32(0, -5);
    b.op(Op::ArgMove).u(0);
    b.op(Op::Ffi).u(1).u(abs as u64);
    b.op(Op::Return).u(1);

    assert_eq!(build_vm(&b).run(), 5);
}

#[test]
fn arity_mismatch_traps_with_bad_args() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 3);
    let unary = b.declare_function(&[i32_t()], i32_t(), 2);

    b.label(main);
    // No argument staged for a one-parameter function.
    b.op(Op::TryStatic).u(0).u(unary as u64);
    b.op(Op::Typetest).u(1).u(0).ty(i32_t());
    b.op(Op::Cond).u(1).u(1).u(2);
    b.label(main);
    b.const_i32(2, 0);
    b.op(Op::Return).u(2);
    b.label(main);
    b.const_i32(2, 1);
    b.op(Op::Return).u(2);

    b.label(unary);
    b.op(Op::Return).u(0);

    assert_eq!(build_vm(&b).run(), 1);
}

#[test]
fn convert_between_numeric_widths() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 3);
    b.label(main);
    b.const_f64(0, 3.9);
    b.op(Op::Convert).u(1).vt(ValueType::I32).u(0);
    b.op(Op::Return).u(1);

    assert_eq!(build_vm(&b).run(), 3);
}

#[test]
fn globals_and_strings_are_available() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 4);
    let g = b.add_global(ValueType::I32, 31 as u64);
    let s = b.add_string(b"hello");

    b.label(main);
    b.op(Op::Global).u(0).u(g as u64);
    b.op(Op::String).u(1).u(s as u64);
    b.op(Op::Len).u(2).u(1);
    b.op(Op::Convert).u(2).vt(ValueType::I32).u(2);
    b.op(Op::Add).u(3).u(0).u(2);
    b.op(Op::Return).u(3);

    // 31 + len("hello")
    assert_eq!(build_vm(&b).run(), 36);
}

#[test]
fn finalizers_run_when_the_frame_unwinds() {
    let mut b = BytecodeBuilder::new();
    let counter = b.add_class(&[(0, TypeId::prim(ValueType::I32))], &[]);

    let main = b.declare_function(&[], i32_t(), 4);
    let callee = b.declare_function(&[counter], i32_t(), 4);
    let finalizer = b.declare_function(&[TypeId::DYN], i32_t(), 8);
    let watcher = b.add_class(&[(0, TypeId::DYN)], &[(vbci_bytecode::FINAL_METHOD_ID, finalizer)]);

    b.label(main);
    b.const_i32(0, 5);
    b.op(Op::ArgMove).u(0);
    b.op(Op::Region).u(1).u(RegionType::Rc as u64).ty(counter);
    b.op(Op::ArgCopy).u(1);
    b.op(Op::CallStatic).u(2).u(callee as u64);
    b.op(Op::FieldRefCopy).u(3).u(1).u(0);
    b.op(Op::Load).u(0).u(3);
    b.op(Op::Return).u(0);

    // The callee wraps the counter in a stack-allocated watcher and
    // returns; teardown must run the watcher's finalizer.
    b.label(callee);
    b.op(Op::ArgMove).u(0);
    b.op(Op::Stack).u(1).ty(watcher);
    b.const_i32(2, 0);
    b.op(Op::Return).u(2);

    // finalizer(w): w.target.value += 1
    b.label(finalizer);
    b.op(Op::FieldRefCopy).u(1).u(0).u(0);
    b.op(Op::Load).u(2).u(1);
    b.op(Op::FieldRefCopy).u(3).u(2).u(0);
    b.op(Op::Load).u(4).u(3);
    b.const_i32(5, 1);
    b.op(Op::Add).u(6).u(4).u(5);
    b.op(Op::StoreCopy).u(7).u(3).u(6);
    b.const_i32(7, 0);
    b.op(Op::Return).u(7);

    assert_eq!(build_vm(&b).run(), 6);
}
