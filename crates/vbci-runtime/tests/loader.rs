// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Loader validation: malformed files must be rejected before execution.

use std::io::Write;
use std::path::Path;

use vbci_bytecode::{BytecodeBuilder, Op, TypeId, ValueType, FINAL_METHOD_ID};
use vbci_runtime::{loader, LoadError, Vm};

fn i32_t() -> TypeId {
    TypeId::prim(ValueType::I32)
}

fn minimal() -> BytecodeBuilder {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[], i32_t(), 1);
    b.label(main);
    b.const_i32(0, 0);
    b.op(Op::Return).u(0);
    b
}

#[test]
fn round_trips_through_a_real_file() {
    let b = minimal();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&b.finish()).unwrap();

    let vm = Vm::load(file.path()).expect("loads");
    assert_eq!(vm.run(), 0);
}

#[test]
fn rejects_a_bad_magic_number() {
    let mut bytes = minimal().finish();
    bytes[0] ^= 0xFF;
    assert!(matches!(
        loader::parse(Path::new("<test>"), &bytes),
        Err(LoadError::BadMagic { .. })
    ));
}

#[test]
fn rejects_a_bad_version() {
    let mut bytes = minimal().finish();
    bytes[4] = 0xFE;
    assert!(matches!(
        loader::parse(Path::new("<test>"), &bytes),
        Err(LoadError::BadVersion { .. })
    ));
}

#[test]
fn rejects_a_truncated_file() {
    let bytes = minimal().finish();
    assert!(loader::parse(Path::new("<test>"), &bytes[..bytes.len() - 4]).is_err());
}

#[test]
fn rejects_a_main_with_parameters() {
    let mut b = BytecodeBuilder::new();
    let main = b.declare_function(&[i32_t()], i32_t(), 1);
    b.label(main);
    b.op(Op::Return).u(0);
    assert!(matches!(
        loader::parse(Path::new("<test>"), &b.finish()),
        Err(LoadError::BadMainSignature { .. })
    ));
}

#[test]
fn rejects_a_finalizer_with_the_wrong_arity() {
    let mut b = minimal();
    let bad_final = b.declare_function(&[], i32_t(), 1);
    b.label(bad_final);
    b.const_i32(0, 0);
    b.op(Op::Return).u(0);
    b.add_class(&[(0, i32_t())], &[(FINAL_METHOD_ID, bad_final)]);
    assert!(matches!(
        loader::parse(Path::new("<test>"), &b.finish()),
        Err(LoadError::BadFinalizer { .. })
    ));
}

#[test]
fn lays_out_classes_with_c_compatible_offsets() {
    let mut b = minimal();
    // i8 then i32: the second field must land on its natural alignment.
    b.add_class(
        &[(0, TypeId::prim(ValueType::I8)), (1, i32_t())],
        &[],
    );
    let program = loader::parse(Path::new("<test>"), &b.finish()).unwrap();
    let cls = program.cls(0).unwrap();
    assert_eq!(cls.fields[0].offset, 0);
    assert_eq!(cls.fields[1].offset, 4);
    assert_eq!(cls.fields[1].size, 4);
}

#[test]
fn empty_classes_get_an_immortal_singleton() {
    let mut b = minimal();
    b.add_class(&[], &[]);
    let program = loader::parse(Path::new("<test>"), &b.finish()).unwrap();
    let cls = program.cls(0).unwrap();
    let singleton = cls.singleton.expect("singleton exists");
    assert!(singleton.header().location().is_immortal());
}

#[test]
fn unresolvable_symbols_fail_the_load() {
    let mut b = minimal();
    let lib = b.add_lib(None);
    b.add_symbol(lib, "vbci_no_such_symbol_exists", None, &[], i32_t(), false);
    assert!(matches!(
        loader::parse(Path::new("<test>"), &b.finish()),
        Err(LoadError::BadSymbol { .. })
    ));
}
