// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use num_enum::TryFromPrimitive;

/// Runtime tag of a value. The first seventeen variants (`None` through
/// `Ptr`) are the primitive types; each owns a primitive class with its own
/// method table in the program file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum ValueType {
    None,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    ILong,
    ULong,
    ISize,
    USize,
    F32,
    F64,
    Ptr,
    Object,
    Array,
    Cown,
    RegisterRef,
    FieldRef,
    ArrayRef,
    CownRef,
    Function,
    Error,
    Invalid,
}

/// Number of primitive classes carried in every program file, one per
/// primitive [`ValueType`].
pub const NUM_PRIMITIVE_CLASSES: usize = ValueType::Ptr as usize + 1;

impl ValueType {
    pub fn is_primitive(self) -> bool {
        (self as usize) < NUM_PRIMITIVE_CLASSES
    }

    /// True for the numeric types `convert` accepts as a target.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ValueType::Bool
                | ValueType::I8
                | ValueType::I16
                | ValueType::I32
                | ValueType::I64
                | ValueType::U8
                | ValueType::U16
                | ValueType::U32
                | ValueType::U64
                | ValueType::ILong
                | ValueType::ULong
                | ValueType::ISize
                | ValueType::USize
                | ValueType::F32
                | ValueType::F64
        )
    }
}

/// Flavour of mutable region requested by the `Region` family of opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum RegionType {
    Rc,
    Gc,
    Arena,
}

/// Non-local-return discipline of a call frame. The discipline is recorded
/// on the *caller* at the call site and consulted when the callee unwinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CallType {
    /// `Return` delivers, `Raise` unwraps into a `Return`, `Throw` rethrows.
    Call,
    /// `Return` delivers, `Raise` and `Throw` both rethrow.
    Subcall,
    /// Any condition becomes a plain `Return`.
    Catch,
}

/// The three-way non-local return condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Condition {
    Return,
    Raise,
    Throw,
}
