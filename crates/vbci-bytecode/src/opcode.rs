// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use num_enum::TryFromPrimitive;

/// The instruction set. Every instruction begins with a LEB128-encoded
/// opcode followed by LEB128 operands in the order documented on each
/// variant; `dst`, `src`, `lhs`, `rhs` are register indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Op {
    /// dst, global-id. Copy a program global.
    Global,
    /// dst, value-type, literal. Materialise a typed literal.
    Const,
    /// dst, string-id. Reference an interned u8 array.
    String,
    /// dst, value-type, src. Numeric cast.
    Convert,
    /// dst, class-id. Construct in the frame-local region.
    New,
    /// dst, class-id. Construct on the stack.
    Stack,
    /// dst, region-reg, class-id. Construct in an existing region.
    Heap,
    /// dst, region-type, class-id. Construct in a fresh region.
    Region,
    /// dst, size-reg, type-id. Frame-local array.
    NewArray,
    /// dst, type-id, size. Frame-local array, inline size.
    NewArrayConst,
    /// dst, size-reg, type-id. Stack array.
    StackArray,
    /// dst, type-id, size. Stack array, inline size.
    StackArrayConst,
    /// dst, region-reg, size-reg, type-id. Array in an existing region.
    HeapArray,
    /// dst, region-reg, type-id, size. Same, inline size.
    HeapArrayConst,
    /// dst, region-type, size-reg, type-id. Array in a fresh region.
    RegionArray,
    /// dst, region-type, type-id, size. Same, inline size.
    RegionArrayConst,
    /// dst, src.
    Copy,
    /// dst, src. Invalidates src.
    Move,
    /// dst.
    Drop,
    /// dst, src. Reference to a register in this frame.
    RegisterRef,
    /// dst, src, field-id. Consumes src.
    FieldRefMove,
    /// dst, src, field-id.
    FieldRefCopy,
    /// dst, src, index-reg. Consumes src.
    ArrayRefMove,
    /// dst, src, index-reg.
    ArrayRefCopy,
    /// dst, src, index. Consumes src.
    ArrayRefMoveConst,
    /// dst, src, index.
    ArrayRefCopyConst,
    /// dst, src. Dereference one level.
    Load,
    /// dst, ref-reg, src. Store through a reference; dst takes the previous
    /// value.
    StoreMove,
    /// dst, ref-reg, src.
    StoreCopy,
    /// dst, function-id.
    LookupStatic,
    /// dst, src, method-id. Dynamic dispatch through src's class.
    LookupDynamic,
    /// dst, symbol-id. Raw pointer to an FFI symbol.
    LookupFFI,
    /// src. Push the next pending argument.
    ArgMove,
    /// src.
    ArgCopy,
    /// dst, function-id.
    CallStatic,
    /// dst, function-reg.
    CallDynamic,
    /// dst, function-id.
    SubcallStatic,
    /// dst, function-reg.
    SubcallDynamic,
    /// dst, function-id.
    TryStatic,
    /// dst, function-reg.
    TryDynamic,
    /// dst, symbol-id. Foreign call over the pending arguments.
    Ffi,
    /// dst, type-id, function-id. Schedule a behaviour; dst takes the result
    /// cown.
    WhenStatic,
    /// dst, type-id, function-reg.
    WhenDynamic,
    /// dst, src, type-id.
    Typetest,
    /// dst, src. Convert the reachable mutable graph to an immutable SCC.
    Freeze,
    /// function-id.
    TailcallStatic,
    /// function-reg.
    TailcallDynamic,
    /// src.
    Return,
    /// src.
    Raise,
    /// src.
    Throw,
    /// cond-reg, true-label, false-label.
    Cond,
    /// label.
    Jump,

    // Binary operators: dst, lhs, rhs.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Min,
    Max,
    LogBase,
    Atan2,

    // Unary operators: dst, src.
    Neg,
    Not,
    Abs,
    Ceil,
    Floor,
    Exp,
    Log,
    Sqrt,
    Cbrt,
    IsInf,
    IsNaN,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Bits,
    Len,
    Ptr,
    Read,

    // Nullary constants: dst.
    ConstE,
    ConstPi,
    ConstInf,
    ConstNan,
}
