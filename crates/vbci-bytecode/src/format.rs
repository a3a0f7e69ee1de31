// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bytecode file-format constants.
//!
//! The file is little-endian throughout (byteswapped on load for big-endian
//! hosts):
//!
//! ```text
//! u32  magic
//! u32  version
//! u64  debug_offset            (byte offset from file start, 0 = none)
//! u32  function_count
//! function_count x Function:
//!    u32 packed                { label_count | param_count << 8 |
//!                                register_count << 16 }
//!    label_count x u64         label pc (byte offset into the code blob)
//!    u64 debug_info            (1-based debug string index, 0 = none)
//!    u32 return_type_id
//!    param_count x u32         param type id
//! NUM_PRIMITIVE_CLASSES x MethodTable
//! u32  class_count
//! class_count x Class:
//!    u64 debug_info
//!    u32 field_count
//!    field_count x (u32 field_name_id, u32 field_type_id)
//!    MethodTable
//! u32  string_count
//! string_count x (u32 len, bytes)
//! u32  lib_count
//! lib_count x Lib:
//!    u32 path_string_id        (STRING_NONE = the host process)
//!    u32 symbol_count
//!    symbol_count x Symbol:
//!       u32 name_string_id
//!       u32 version_string_id  (STRING_NONE = unversioned)
//!       u32 flags              (bit 0: vararg)
//!       u32 return_type_id
//!       u32 param_count
//!       param_count x u32      param type id
//! u32  global_count
//! global_count x (u8 value_type, u64 bits)
//! u64  code_size
//! code bytes                   (LEB128 instruction stream)
//! debug blob at debug_offset:  u32 count, count x (u32 len, bytes)
//! ```
//!
//! `MethodTable` is `u32 count` followed by `count x (u32 method_id,
//! u32 function_id)`. A method with id [`FINAL_METHOD_ID`] is the class
//! finalizer and must name a one-parameter function.

/// `VBCI` in little-endian byte order.
pub const MAGIC: u32 = u32::from_le_bytes(*b"VBCI");

pub const CURRENT_VERSION: u32 = 1;

/// Function id of the program entry point.
pub const MAIN_FUNC_ID: u32 = 0;

/// Reserved method id marking a finalizer.
pub const FINAL_METHOD_ID: u32 = 0;

/// Upper bound on fields per class and registers per function.
pub const MAX_FIELDS: usize = 255;

/// "No string" marker for optional string-table references.
pub const STRING_NONE: u32 = u32::MAX;

/// Symbol flag: the symbol is variadic.
pub const SYMBOL_FLAG_VARARG: u32 = 1;
