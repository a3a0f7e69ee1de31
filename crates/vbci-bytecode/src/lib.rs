// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared bytecode program model: the instruction set, value and type
//! identifiers, the file-format constants, and a cursor for decoding the
//! LEB128 instruction stream. The loader and interpreter both build on this
//! crate; tests use [`BytecodeBuilder`] to produce literal program files.

mod builder;
mod cursor;
mod format;
mod opcode;
mod type_id;
mod value_type;

pub use builder::BytecodeBuilder;
pub use cursor::{Cursor, CursorError};
pub use format::*;
pub use opcode::Op;
pub use type_id::TypeId;
pub use value_type::{CallType, Condition, RegionType, ValueType, NUM_PRIMITIVE_CLASSES};
