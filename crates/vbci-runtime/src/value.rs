// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The universal runtime datum. Values are moved, not cloned: copies are
//! explicit (`copy_reg` / `copy_field`, each performing the matching
//! refcount increment) and drops are explicit (`drop_reg` / `drop_field`).
//! A moved-from value is left `Invalid`.

use std::ffi::c_void;
use std::fmt;

use vbci_bytecode::{TypeId, ValueType};

use crate::array::ArrPtr;
use crate::cown::CownPtr;
use crate::error::{ErrorInfo, ErrorKind};
use crate::header::HeaderPtr;
use crate::location::Location;
use crate::object::ObjPtr;
use crate::program::Program;
use crate::region::RegionPtr;

/// A tagged runtime value. `Invalid` is the all-zero state, so zeroed field
/// storage decodes as invalid and moved-from registers cost nothing to
/// reset.
#[derive(Default)]
#[repr(C, u8)]
pub enum Value {
    #[default]
    Invalid,
    None,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    ILong(i64),
    ULong(u64),
    ISize(isize),
    USize(usize),
    F32(f32),
    F64(f64),
    Ptr(*mut c_void),
    Object(ObjPtr, bool),
    Array(ArrPtr, bool),
    Cown {
        cown: CownPtr,
        readonly: bool,
    },
    RegisterRef {
        index: usize,
        frame: Location,
    },
    FieldRef {
        obj: ObjPtr,
        field: u32,
        readonly: bool,
    },
    ArrayRef {
        arr: ArrPtr,
        index: usize,
        readonly: bool,
    },
    CownRef {
        cown: CownPtr,
        readonly: bool,
    },
    Function(u32),
    Error(ErrorInfo),
}

// Values cross threads only inside cown contents and behaviour closures,
// which the sendability protocol restricts to immutable or root-owned data.
unsafe impl Send for Value {}

impl Value {
    pub fn none() -> Value {
        Value::None
    }

    pub fn null() -> Value {
        Value::Ptr(std::ptr::null_mut())
    }

    pub fn tag(&self) -> ValueType {
        match self {
            Value::Invalid => ValueType::Invalid,
            Value::None => ValueType::None,
            Value::Bool(_) => ValueType::Bool,
            Value::I8(_) => ValueType::I8,
            Value::I16(_) => ValueType::I16,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::U8(_) => ValueType::U8,
            Value::U16(_) => ValueType::U16,
            Value::U32(_) => ValueType::U32,
            Value::U64(_) => ValueType::U64,
            Value::ILong(_) => ValueType::ILong,
            Value::ULong(_) => ValueType::ULong,
            Value::ISize(_) => ValueType::ISize,
            Value::USize(_) => ValueType::USize,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::Ptr(_) => ValueType::Ptr,
            Value::Object(..) => ValueType::Object,
            Value::Array(..) => ValueType::Array,
            Value::Cown { .. } => ValueType::Cown,
            Value::RegisterRef { .. } => ValueType::RegisterRef,
            Value::FieldRef { .. } => ValueType::FieldRef,
            Value::ArrayRef { .. } => ValueType::ArrayRef,
            Value::CownRef { .. } => ValueType::CownRef,
            Value::Function(_) => ValueType::Function,
            Value::Error(_) => ValueType::Error,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Value::Invalid)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn is_cown(&self) -> bool {
        matches!(self, Value::Cown { .. })
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    pub fn is_header(&self) -> bool {
        matches!(self, Value::Object(..) | Value::Array(..))
    }

    pub fn is_readonly(&self) -> bool {
        match self {
            Value::Object(_, ro) | Value::Array(_, ro) => *ro,
            Value::Cown { readonly, .. }
            | Value::FieldRef { readonly, .. }
            | Value::ArrayRef { readonly, .. }
            | Value::CownRef { readonly, .. } => *readonly,
            _ => false,
        }
    }

    pub fn clear_readonly(&mut self) {
        match self {
            Value::Object(_, ro) | Value::Array(_, ro) => *ro = false,
            Value::Cown { readonly, .. }
            | Value::FieldRef { readonly, .. }
            | Value::ArrayRef { readonly, .. }
            | Value::CownRef { readonly, .. } => *readonly = false,
            _ => {}
        }
    }

    fn set_readonly(&mut self, ro: bool) {
        if ro {
            match self {
                Value::Object(_, readonly) | Value::Array(_, readonly) => *readonly = true,
                Value::Cown { readonly, .. }
                | Value::FieldRef { readonly, .. }
                | Value::ArrayRef { readonly, .. }
                | Value::CownRef { readonly, .. } => *readonly = true,
                _ => {}
            }
        }
    }

    pub fn header(&self) -> Option<HeaderPtr> {
        match self {
            Value::Object(obj, _) | Value::FieldRef { obj, .. } => Some(obj.header()),
            Value::Array(arr, _) | Value::ArrayRef { arr, .. } => Some(arr.header()),
            _ => None,
        }
    }

    pub fn function(&self) -> Option<u32> {
        match self {
            Value::Function(f) => Some(*f),
            _ => None,
        }
    }

    pub fn cown(&self) -> Result<CownPtr, ErrorKind> {
        match self {
            Value::Cown { cown, .. } => Ok(*cown),
            _ => Err(ErrorKind::BadConversion),
        }
    }

    pub fn get_bool(&self) -> Result<bool, ErrorKind> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(ErrorKind::BadConditional),
        }
    }

    pub fn get_i32(&self) -> Result<i32, ErrorKind> {
        match self {
            Value::I32(v) => Ok(*v),
            _ => Err(ErrorKind::BadConversion),
        }
    }

    /// Unsigned index operand (array sizes and element indices).
    pub fn index(&self) -> Result<usize, ErrorKind> {
        match self {
            Value::U8(v) => Ok(*v as usize),
            Value::U16(v) => Ok(*v as usize),
            Value::U32(v) => Ok(*v as usize),
            Value::U64(v) => Ok(*v as usize),
            Value::USize(v) => Ok(*v),
            _ => Err(ErrorKind::BadRefTarget),
        }
    }

    /// The ownership-lattice location of the value's referent.
    pub fn location(&self) -> Location {
        match self {
            Value::RegisterRef { frame, .. } => *frame,
            Value::Object(obj, _) | Value::FieldRef { obj, .. } => obj.header().location(),
            Value::Array(arr, _) | Value::ArrayRef { arr, .. } => arr.header().location(),
            Value::Cown { .. } | Value::CownRef { .. } => Location::IMMUTABLE,
            _ => Location::IMMORTAL,
        }
    }

    pub fn region(&self) -> Option<RegionPtr> {
        self.header().and_then(|h| h.region())
    }

    /// Whether this value may cross a cown boundary.
    pub fn is_sendable(&self) -> bool {
        match self {
            Value::Object(obj, _) => obj.header().sendable(),
            Value::Array(arr, _) => arr.header().sendable(),
            Value::Cown { .. } => true,
            Value::Ptr(_)
            | Value::RegisterRef { .. }
            | Value::FieldRef { .. }
            | Value::ArrayRef { .. }
            | Value::CownRef { .. } => false,
            _ => true,
        }
    }

    /// The reified type id. A register-ref's content type is refined by the
    /// interpreter, which can see the referenced register.
    pub fn type_id(&self, prog: &Program) -> TypeId {
        match self {
            Value::Object(obj, _) => obj.header().type_id(),
            Value::Array(arr, _) => arr.header().type_id(),
            Value::Cown { cown, .. } => cown.content_type_id().cown_of(),
            Value::FieldRef { obj, field, .. } => prog
                .field_type_id(obj.class_index(), *field)
                .unwrap_or(TypeId::DYN)
                .ref_of(),
            Value::ArrayRef { arr, .. } => arr.content_type_id().ref_of(),
            Value::CownRef { cown, .. } => cown.content_type_id().ref_of(),
            Value::RegisterRef { .. } => TypeId::DYN.ref_of(),
            Value::Function(_) | Value::Error(_) | Value::Invalid => TypeId::DYN,
            _ => TypeId::prim(self.tag()),
        }
    }

    fn shallow(&self) -> Value {
        // Bit copy with no refcount movement; every caller pairs it with
        // the appropriate inc.
        unsafe { std::ptr::read(self) }
    }

    fn inc(&self, register: bool) {
        match self {
            Value::Object(obj, ro) if !ro => obj.header().inc(register),
            Value::FieldRef { obj, readonly, .. } if !readonly => obj.header().inc(register),
            Value::Array(arr, ro) if !ro => arr.header().inc(register),
            Value::ArrayRef { arr, readonly, .. } if !readonly => arr.header().inc(register),
            // Cowns live outside the region model; there is no stack RC.
            Value::Cown { cown, .. } | Value::CownRef { cown, .. } => cown.inc(),
            _ => {}
        }
    }

    fn dec(&self, register: bool, prog: &Program) {
        match self {
            Value::Object(obj, ro) if !ro => obj.header().dec(register, prog),
            Value::FieldRef { obj, readonly, .. } if !readonly => {
                obj.header().dec(register, prog)
            }
            Value::Array(arr, ro) if !ro => arr.header().dec(register, prog),
            Value::ArrayRef { arr, readonly, .. } if !readonly => {
                arr.header().dec(register, prog)
            }
            Value::Cown { cown, .. } | Value::CownRef { cown, .. } => cown.dec(prog),
            _ => {}
        }
    }

    /// Copy into a register: bumps the refcount and the region stack RC.
    pub fn copy_reg(&self) -> Value {
        let v = self.shallow();
        v.inc(true);
        v
    }

    /// Copy into a field slot: bumps the refcount only.
    pub fn copy_field(&self) -> Value {
        let v = self.shallow();
        v.inc(false);
        v
    }

    pub fn take(&mut self) -> Value {
        std::mem::take(self)
    }

    pub fn drop_reg(&mut self, prog: &Program) {
        self.dec(true, prog);
        *self = Value::Invalid;
    }

    pub fn drop_field(&mut self, prog: &Program) {
        self.dec(false, prog);
        *self = Value::Invalid;
    }

    /// Field drop that also releases a stack-RC unit when the dying field
    /// was a stack-resident reference into another region.
    pub fn drop_field_flavored(&mut self, register: bool, prog: &Program) {
        self.dec(register, prog);
        *self = Value::Invalid;
    }

    /// Move-assign into a register slot, dropping what it held.
    pub fn assign(&mut self, v: Value, prog: &Program) {
        self.dec(true, prog);
        *self = v;
    }

    // Reference construction.

    /// Build a field reference. `is_move` consumes the handle; a copy takes
    /// a fresh register-flavoured increment.
    pub fn ref_field(
        &mut self,
        is_move: bool,
        field_name: u32,
        prog: &Program,
    ) -> Result<Value, ErrorKind> {
        match self.shallow() {
            Value::Object(obj, readonly) => {
                let field = obj.field_index(field_name, prog)?;
                if is_move {
                    *self = Value::Invalid;
                } else {
                    self.inc(true);
                }
                Ok(Value::FieldRef {
                    obj,
                    field,
                    readonly,
                })
            }
            Value::Cown { cown, .. } => {
                if is_move {
                    *self = Value::Invalid;
                } else {
                    self.inc(false);
                }
                Ok(Value::CownRef {
                    cown,
                    readonly: false,
                })
            }
            _ => Err(ErrorKind::BadRefTarget),
        }
    }

    /// Build an array element reference; bounds-checked.
    pub fn ref_array(&mut self, is_move: bool, index: usize) -> Result<Value, ErrorKind> {
        match self.shallow() {
            Value::Array(arr, readonly) => {
                if index >= arr.len() {
                    return Err(ErrorKind::BadArrayIndex);
                }
                if is_move {
                    *self = Value::Invalid;
                } else {
                    self.inc(true);
                }
                Ok(Value::ArrayRef {
                    arr,
                    index,
                    readonly,
                })
            }
            _ => Err(ErrorKind::BadRefTarget),
        }
    }

    /// Dereference one level. Register refs are resolved by the
    /// interpreter, which owns the register file.
    pub fn load(&self, prog: &Program) -> Result<Value, ErrorKind> {
        let (mut v, ro) = match self {
            Value::FieldRef {
                obj,
                field,
                readonly,
            } => (obj.load_field(*field, prog)?, *readonly),
            Value::ArrayRef {
                arr,
                index,
                readonly,
            } => (arr.load_elem(*index)?, *readonly),
            Value::CownRef { cown, readonly } => {
                let mut v = cown.load();
                v.set_readonly(*readonly);
                return Ok(v);
            }
            _ => return Err(ErrorKind::BadLoadTarget),
        };
        v.inc(true);
        v.set_readonly(ro);
        Ok(v)
    }

    /// Store through a reference, returning the previous value. Register
    /// refs are resolved by the interpreter.
    pub fn store(
        &self,
        is_move: bool,
        src: &mut Value,
        prog: &Program,
    ) -> Result<Value, ErrorKind> {
        if self.is_readonly() {
            return Err(ErrorKind::BadStoreTarget);
        }
        // Read-only aliases can be loaded from but never stored anywhere.
        if src.is_readonly() {
            return Err(ErrorKind::BadStore);
        }
        match self {
            Value::FieldRef { obj, field, .. } => obj.store_field(*field, is_move, src, prog),
            Value::ArrayRef { arr, index, .. } => arr.store_elem(*index, is_move, src, prog),
            Value::CownRef { cown, .. } => cown.store(is_move, src, prog),
            _ => Err(ErrorKind::BadStoreTarget),
        }
    }

    /// Dynamic method lookup through the value's runtime class.
    pub fn method(&self, method_id: u32, prog: &Program) -> Result<u32, ErrorKind> {
        let class = match self {
            Value::Object(obj, _) => prog.cls(obj.class_index())?,
            v if v.tag().is_primitive() => prog.primitive_cls(v.tag()),
            _ => return Err(ErrorKind::BadMethodTarget),
        };
        class.method(method_id).ok_or(ErrorKind::MethodNotFound)
    }

    // Raw slot marshalling. Typed fields and array elements store
    // primitives inline by stride and handles as C-compatible pointers
    // (one past the header, pointing at the fields or elements); `Invalid`
    // slots hold a whole `Value`.

    /// Decode a raw slot. The result is a borrow: no refcount is taken.
    ///
    /// # Safety is delegated to callers keeping slot/vt pairs coherent.
    pub fn from_addr(vt: ValueType, addr: *mut u8) -> Value {
        unsafe {
            match vt {
                ValueType::None => Value::None,
                ValueType::Bool => Value::Bool(*(addr as *const bool)),
                ValueType::I8 => Value::I8(*(addr as *const i8)),
                ValueType::I16 => Value::I16(*(addr as *const i16)),
                ValueType::I32 => Value::I32(*(addr as *const i32)),
                ValueType::I64 => Value::I64(*(addr as *const i64)),
                ValueType::U8 => Value::U8(*(addr as *const u8)),
                ValueType::U16 => Value::U16(*(addr as *const u16)),
                ValueType::U32 => Value::U32(*(addr as *const u32)),
                ValueType::U64 => Value::U64(*(addr as *const u64)),
                ValueType::ILong => Value::ILong(*(addr as *const libc::c_long) as i64),
                ValueType::ULong => Value::ULong(*(addr as *const libc::c_ulong) as u64),
                ValueType::ISize => Value::ISize(*(addr as *const isize)),
                ValueType::USize => Value::USize(*(addr as *const usize)),
                ValueType::F32 => Value::F32(*(addr as *const f32)),
                ValueType::F64 => Value::F64(*(addr as *const f64)),
                ValueType::Ptr => Value::Ptr(*(addr as *const *mut c_void)),
                ValueType::Object => match ObjPtr::from_fields_ptr(*(addr as *const *mut u8)) {
                    Some(obj) => Value::Object(obj, false),
                    None => Value::Invalid,
                },
                ValueType::Array => match ArrPtr::from_elems_ptr(*(addr as *const *mut u8)) {
                    Some(arr) => Value::Array(arr, false),
                    None => Value::Invalid,
                },
                ValueType::Cown => match CownPtr::from_raw(*(addr as *const *mut c_void)) {
                    Some(cown) => Value::Cown {
                        cown,
                        readonly: false,
                    },
                    None => Value::Invalid,
                },
                _ => std::ptr::read(addr as *const Value),
            }
        }
    }

    /// Encode into a raw slot, consuming the value (no refcount movement).
    pub fn write_addr(self, vt: ValueType, addr: *mut u8) {
        unsafe {
            match (vt, self) {
                (ValueType::None, _) => {}
                (ValueType::Bool, Value::Bool(v)) => *(addr as *mut bool) = v,
                (ValueType::I8, Value::I8(v)) => *(addr as *mut i8) = v,
                (ValueType::I16, Value::I16(v)) => *(addr as *mut i16) = v,
                (ValueType::I32, Value::I32(v)) => *(addr as *mut i32) = v,
                (ValueType::I64, Value::I64(v)) => *(addr as *mut i64) = v,
                (ValueType::U8, Value::U8(v)) => *addr = v,
                (ValueType::U16, Value::U16(v)) => *(addr as *mut u16) = v,
                (ValueType::U32, Value::U32(v)) => *(addr as *mut u32) = v,
                (ValueType::U64, Value::U64(v)) => *(addr as *mut u64) = v,
                (ValueType::ILong, Value::ILong(v)) => {
                    *(addr as *mut libc::c_long) = v as libc::c_long
                }
                (ValueType::ULong, Value::ULong(v)) => {
                    *(addr as *mut libc::c_ulong) = v as libc::c_ulong
                }
                (ValueType::ISize, Value::ISize(v)) => *(addr as *mut isize) = v,
                (ValueType::USize, Value::USize(v)) => *(addr as *mut usize) = v,
                (ValueType::F32, Value::F32(v)) => *(addr as *mut f32) = v,
                (ValueType::F64, Value::F64(v)) => *(addr as *mut f64) = v,
                (ValueType::Ptr, Value::Ptr(v)) => *(addr as *mut *mut c_void) = v,
                (ValueType::Object, Value::Object(obj, _)) => {
                    *(addr as *mut *mut u8) = obj.fields_ptr()
                }
                (ValueType::Object, Value::Invalid) => {
                    *(addr as *mut *mut u8) = std::ptr::null_mut()
                }
                (ValueType::Array, Value::Array(arr, _)) => {
                    *(addr as *mut *mut u8) = arr.elems_ptr()
                }
                (ValueType::Array, Value::Invalid) => {
                    *(addr as *mut *mut u8) = std::ptr::null_mut()
                }
                (ValueType::Cown, Value::Cown { cown, .. }) => {
                    *(addr as *mut *mut c_void) = cown.as_raw()
                }
                (ValueType::Cown, Value::Invalid) => {
                    *(addr as *mut *mut c_void) = std::ptr::null_mut()
                }
                (ValueType::Invalid, v) => std::ptr::write(addr as *mut Value, v),
                // Typed slots only ever receive matching values; the
                // subtype gate on stores guarantees it.
                (vt, v) => debug_assert!(false, "slot {vt:?} cannot hold {v:?}"),
            }
        }
    }

    /// Rebuild a value from a raw 64-bit FFI result.
    pub fn from_ffi(vt: ValueType, raw: u64) -> Value {
        match vt {
            ValueType::None => Value::None,
            ValueType::Bool => Value::Bool(raw & 1 != 0),
            ValueType::I8 => Value::I8(raw as i8),
            ValueType::I16 => Value::I16(raw as i16),
            ValueType::I32 => Value::I32(raw as i32),
            ValueType::I64 => Value::I64(raw as i64),
            ValueType::U8 => Value::U8(raw as u8),
            ValueType::U16 => Value::U16(raw as u16),
            ValueType::U32 => Value::U32(raw as u32),
            ValueType::U64 => Value::U64(raw),
            ValueType::ILong => Value::ILong(raw as i64),
            ValueType::ULong => Value::ULong(raw),
            ValueType::ISize => Value::ISize(raw as isize),
            ValueType::USize => Value::USize(raw as usize),
            ValueType::F32 => Value::F32(f32::from_bits(raw as u32)),
            ValueType::F64 => Value::F64(f64::from_bits(raw)),
            ValueType::Ptr => Value::Ptr(raw as *mut c_void),
            ValueType::Object => match ObjPtr::from_fields_ptr(raw as *mut u8) {
                Some(obj) => Value::Object(obj, false),
                None => Value::Invalid,
            },
            ValueType::Array => match ArrPtr::from_elems_ptr(raw as *mut u8) {
                Some(arr) => Value::Array(arr, false),
                None => Value::Invalid,
            },
            _ => Value::Invalid,
        }
    }

    /// Address of the scalar payload for libffi argument binding. Handles
    /// are bound by the interpreter, which owns the marshalling scratch.
    pub fn ffi_addr(&mut self) -> Result<*mut c_void, ErrorKind> {
        macro_rules! payload {
            ($v:expr) => {
                $v as *mut _ as *mut c_void
            };
        }
        match self {
            Value::None => Ok(std::ptr::null_mut()),
            Value::Bool(v) => Ok(payload!(v)),
            Value::I8(v) => Ok(payload!(v)),
            Value::I16(v) => Ok(payload!(v)),
            Value::I32(v) => Ok(payload!(v)),
            Value::I64(v) => Ok(payload!(v)),
            Value::U8(v) => Ok(payload!(v)),
            Value::U16(v) => Ok(payload!(v)),
            Value::U32(v) => Ok(payload!(v)),
            Value::U64(v) => Ok(payload!(v)),
            Value::ILong(v) => Ok(payload!(v)),
            Value::ULong(v) => Ok(payload!(v)),
            Value::ISize(v) => Ok(payload!(v)),
            Value::USize(v) => Ok(payload!(v)),
            Value::F32(v) => Ok(payload!(v)),
            Value::F64(v) => Ok(payload!(v)),
            Value::Ptr(v) => Ok(payload!(v)),
            _ => Err(ErrorKind::BadOperand),
        }
    }
}

// Arithmetic. Binary operators demand matching tags; unary operators
// follow the category table of the operator.

macro_rules! arith_arm {
    (none, $ctor:path) => {
        Err(ErrorKind::BadOperand)
    };
    ($e:expr, $ctor:path) => {
        match $e {
            Some(x) => Ok($ctor(x)),
            None => Err(ErrorKind::BadOperand),
        }
    };
}

/// Same-type numeric binop producing a value of the same tag. Categories:
/// `bool`, signed `int`, `uint`, `float`; `none` rejects with `BadOperand`.
macro_rules! arith {
    ($lhs:expr, $rhs:expr, $a:ident, $b:ident,
     bool: $be:tt, int: $ie:tt, uint: $ue:tt, float: $fe:tt) => {
        match ($lhs, $rhs) {
            (&Value::Bool($a), &Value::Bool($b)) => arith_arm!($be, Value::Bool),
            (&Value::I8($a), &Value::I8($b)) => arith_arm!($ie, Value::I8),
            (&Value::I16($a), &Value::I16($b)) => arith_arm!($ie, Value::I16),
            (&Value::I32($a), &Value::I32($b)) => arith_arm!($ie, Value::I32),
            (&Value::I64($a), &Value::I64($b)) => arith_arm!($ie, Value::I64),
            (&Value::ILong($a), &Value::ILong($b)) => arith_arm!($ie, Value::ILong),
            (&Value::ISize($a), &Value::ISize($b)) => arith_arm!($ie, Value::ISize),
            (&Value::U8($a), &Value::U8($b)) => arith_arm!($ue, Value::U8),
            (&Value::U16($a), &Value::U16($b)) => arith_arm!($ue, Value::U16),
            (&Value::U32($a), &Value::U32($b)) => arith_arm!($ue, Value::U32),
            (&Value::U64($a), &Value::U64($b)) => arith_arm!($ue, Value::U64),
            (&Value::ULong($a), &Value::ULong($b)) => arith_arm!($ue, Value::ULong),
            (&Value::USize($a), &Value::USize($b)) => arith_arm!($ue, Value::USize),
            (&Value::F32($a), &Value::F32($b)) => arith_arm!($fe, Value::F32),
            (&Value::F64($a), &Value::F64($b)) => arith_arm!($fe, Value::F64),
            (l, r) if l.tag() == r.tag() => Err(ErrorKind::BadOperand),
            _ => Err(ErrorKind::MismatchedTypes),
        }
    };
}

/// Same-type comparison producing Bool.
macro_rules! compare {
    ($lhs:expr, $rhs:expr, $a:ident, $b:ident, $e:expr) => {
        match ($lhs, $rhs) {
            (&Value::Bool($a), &Value::Bool($b)) => Ok(Value::Bool($e)),
            (&Value::I8($a), &Value::I8($b)) => Ok(Value::Bool($e)),
            (&Value::I16($a), &Value::I16($b)) => Ok(Value::Bool($e)),
            (&Value::I32($a), &Value::I32($b)) => Ok(Value::Bool($e)),
            (&Value::I64($a), &Value::I64($b)) => Ok(Value::Bool($e)),
            (&Value::ILong($a), &Value::ILong($b)) => Ok(Value::Bool($e)),
            (&Value::ISize($a), &Value::ISize($b)) => Ok(Value::Bool($e)),
            (&Value::U8($a), &Value::U8($b)) => Ok(Value::Bool($e)),
            (&Value::U16($a), &Value::U16($b)) => Ok(Value::Bool($e)),
            (&Value::U32($a), &Value::U32($b)) => Ok(Value::Bool($e)),
            (&Value::U64($a), &Value::U64($b)) => Ok(Value::Bool($e)),
            (&Value::ULong($a), &Value::ULong($b)) => Ok(Value::Bool($e)),
            (&Value::USize($a), &Value::USize($b)) => Ok(Value::Bool($e)),
            (&Value::F32($a), &Value::F32($b)) => Ok(Value::Bool($e)),
            (&Value::F64($a), &Value::F64($b)) => Ok(Value::Bool($e)),
            (l, r) if l.tag() == r.tag() => Err(ErrorKind::BadOperand),
            _ => Err(ErrorKind::MismatchedTypes),
        }
    };
}

type VResult = Result<Value, ErrorKind>;

impl Value {
    pub fn op_add(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: none,
            int: { Some(a.wrapping_add(b)) },
            uint: { Some(a.wrapping_add(b)) },
            float: { Some(a + b) })
    }

    pub fn op_sub(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: none,
            int: { Some(a.wrapping_sub(b)) },
            uint: { Some(a.wrapping_sub(b)) },
            float: { Some(a - b) })
    }

    pub fn op_mul(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: none,
            int: { Some(a.wrapping_mul(b)) },
            uint: { Some(a.wrapping_mul(b)) },
            float: { Some(a * b) })
    }

    pub fn op_div(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: none,
            int: { a.checked_div(b) },
            uint: { a.checked_div(b) },
            float: { Some(a / b) })
    }

    pub fn op_mod(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: none,
            int: { a.checked_rem(b) },
            uint: { a.checked_rem(b) },
            float: { Some(a % b) })
    }

    pub fn op_pow(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: none,
            int: none,
            uint: none,
            float: { Some(a.powf(b)) })
    }

    pub fn op_and(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: { Some(a && b) },
            int: { Some(a & b) },
            uint: { Some(a & b) },
            float: none)
    }

    pub fn op_or(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: { Some(a || b) },
            int: { Some(a | b) },
            uint: { Some(a | b) },
            float: none)
    }

    pub fn op_xor(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: { Some(a ^ b) },
            int: { Some(a ^ b) },
            uint: { Some(a ^ b) },
            float: none)
    }

    pub fn op_shl(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: none,
            int: { Some(a.wrapping_shl(b as u32)) },
            uint: { Some(a.wrapping_shl(b as u32)) },
            float: none)
    }

    pub fn op_shr(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: none,
            int: { Some(a.wrapping_shr(b as u32)) },
            uint: { Some(a.wrapping_shr(b as u32)) },
            float: none)
    }

    pub fn op_eq(&self, v: &Value) -> VResult {
        compare!(self, v, a, b, a == b)
    }

    pub fn op_ne(&self, v: &Value) -> VResult {
        compare!(self, v, a, b, a != b)
    }

    pub fn op_lt(&self, v: &Value) -> VResult {
        compare!(self, v, a, b, a < b)
    }

    pub fn op_le(&self, v: &Value) -> VResult {
        compare!(self, v, a, b, a <= b)
    }

    pub fn op_gt(&self, v: &Value) -> VResult {
        compare!(self, v, a, b, a > b)
    }

    pub fn op_ge(&self, v: &Value) -> VResult {
        compare!(self, v, a, b, a >= b)
    }

    pub fn op_min(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: { Some(a & b) },
            int: { Some(a.min(b)) },
            uint: { Some(a.min(b)) },
            float: { Some(a.min(b)) })
    }

    pub fn op_max(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: { Some(a | b) },
            int: { Some(a.max(b)) },
            uint: { Some(a.max(b)) },
            float: { Some(a.max(b)) })
    }

    pub fn op_logbase(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: none,
            int: none,
            uint: none,
            float: { Some(a.ln() / b.ln()) })
    }

    pub fn op_atan2(&self, v: &Value) -> VResult {
        arith!(self, v, a, b,
            bool: none,
            int: none,
            uint: none,
            float: { Some(a.atan2(b)) })
    }

    pub fn op_neg(&self) -> VResult {
        match self {
            Value::I8(a) => Ok(Value::I8(a.wrapping_neg())),
            Value::I16(a) => Ok(Value::I16(a.wrapping_neg())),
            Value::I32(a) => Ok(Value::I32(a.wrapping_neg())),
            Value::I64(a) => Ok(Value::I64(a.wrapping_neg())),
            Value::ILong(a) => Ok(Value::ILong(a.wrapping_neg())),
            Value::ISize(a) => Ok(Value::ISize(a.wrapping_neg())),
            Value::U8(a) => Ok(Value::U8(a.wrapping_neg())),
            Value::U16(a) => Ok(Value::U16(a.wrapping_neg())),
            Value::U32(a) => Ok(Value::U32(a.wrapping_neg())),
            Value::U64(a) => Ok(Value::U64(a.wrapping_neg())),
            Value::ULong(a) => Ok(Value::ULong(a.wrapping_neg())),
            Value::USize(a) => Ok(Value::USize(a.wrapping_neg())),
            Value::F32(a) => Ok(Value::F32(-a)),
            Value::F64(a) => Ok(Value::F64(-a)),
            _ => Err(ErrorKind::BadOperand),
        }
    }

    pub fn op_not(&self) -> VResult {
        match self {
            Value::Bool(a) => Ok(Value::Bool(!a)),
            Value::I8(a) => Ok(Value::I8(!a)),
            Value::I16(a) => Ok(Value::I16(!a)),
            Value::I32(a) => Ok(Value::I32(!a)),
            Value::I64(a) => Ok(Value::I64(!a)),
            Value::ILong(a) => Ok(Value::ILong(!a)),
            Value::ISize(a) => Ok(Value::ISize(!a)),
            Value::U8(a) => Ok(Value::U8(!a)),
            Value::U16(a) => Ok(Value::U16(!a)),
            Value::U32(a) => Ok(Value::U32(!a)),
            Value::U64(a) => Ok(Value::U64(!a)),
            Value::ULong(a) => Ok(Value::ULong(!a)),
            Value::USize(a) => Ok(Value::USize(!a)),
            _ => Err(ErrorKind::BadOperand),
        }
    }

    pub fn op_abs(&self) -> VResult {
        match self {
            Value::I8(a) => Ok(Value::I8(a.wrapping_abs())),
            Value::I16(a) => Ok(Value::I16(a.wrapping_abs())),
            Value::I32(a) => Ok(Value::I32(a.wrapping_abs())),
            Value::I64(a) => Ok(Value::I64(a.wrapping_abs())),
            Value::ILong(a) => Ok(Value::ILong(a.wrapping_abs())),
            Value::ISize(a) => Ok(Value::ISize(a.wrapping_abs())),
            Value::F32(a) => Ok(Value::F32(a.abs())),
            Value::F64(a) => Ok(Value::F64(a.abs())),
            _ => Err(ErrorKind::BadOperand),
        }
    }

    fn float_unop(&self, f32_op: fn(f32) -> f32, f64_op: fn(f64) -> f64) -> VResult {
        match self {
            Value::F32(a) => Ok(Value::F32(f32_op(*a))),
            Value::F64(a) => Ok(Value::F64(f64_op(*a))),
            _ => Err(ErrorKind::BadOperand),
        }
    }

    fn float_pred(&self, f32_op: fn(f32) -> bool, f64_op: fn(f64) -> bool) -> VResult {
        match self {
            Value::F32(a) => Ok(Value::Bool(f32_op(*a))),
            Value::F64(a) => Ok(Value::Bool(f64_op(*a))),
            _ => Err(ErrorKind::BadOperand),
        }
    }

    pub fn op_ceil(&self) -> VResult {
        self.float_unop(f32::ceil, f64::ceil)
    }

    pub fn op_floor(&self) -> VResult {
        self.float_unop(f32::floor, f64::floor)
    }

    pub fn op_exp(&self) -> VResult {
        self.float_unop(f32::exp, f64::exp)
    }

    pub fn op_log(&self) -> VResult {
        self.float_unop(f32::ln, f64::ln)
    }

    pub fn op_sqrt(&self) -> VResult {
        self.float_unop(f32::sqrt, f64::sqrt)
    }

    pub fn op_cbrt(&self) -> VResult {
        self.float_unop(f32::cbrt, f64::cbrt)
    }

    pub fn op_isinf(&self) -> VResult {
        self.float_pred(f32::is_infinite, f64::is_infinite)
    }

    pub fn op_isnan(&self) -> VResult {
        self.float_pred(f32::is_nan, f64::is_nan)
    }

    pub fn op_sin(&self) -> VResult {
        self.float_unop(f32::sin, f64::sin)
    }

    pub fn op_cos(&self) -> VResult {
        self.float_unop(f32::cos, f64::cos)
    }

    pub fn op_tan(&self) -> VResult {
        self.float_unop(f32::tan, f64::tan)
    }

    pub fn op_asin(&self) -> VResult {
        self.float_unop(f32::asin, f64::asin)
    }

    pub fn op_acos(&self) -> VResult {
        self.float_unop(f32::acos, f64::acos)
    }

    pub fn op_atan(&self) -> VResult {
        self.float_unop(f32::atan, f64::atan)
    }

    pub fn op_sinh(&self) -> VResult {
        self.float_unop(f32::sinh, f64::sinh)
    }

    pub fn op_cosh(&self) -> VResult {
        self.float_unop(f32::cosh, f64::cosh)
    }

    pub fn op_tanh(&self) -> VResult {
        self.float_unop(f32::tanh, f64::tanh)
    }

    pub fn op_asinh(&self) -> VResult {
        self.float_unop(f32::asinh, f64::asinh)
    }

    pub fn op_acosh(&self) -> VResult {
        self.float_unop(f32::acosh, f64::acosh)
    }

    pub fn op_atanh(&self) -> VResult {
        self.float_unop(f32::atanh, f64::atanh)
    }

    /// Reinterpret as raw bits of the matching unsigned width.
    pub fn op_bits(&self) -> VResult {
        match self {
            Value::None => Ok(Value::U8(0)),
            Value::Bool(a) => Ok(Value::U8(*a as u8)),
            Value::I8(a) => Ok(Value::U8(*a as u8)),
            Value::U8(a) => Ok(Value::U8(*a)),
            Value::I16(a) => Ok(Value::U16(*a as u16)),
            Value::U16(a) => Ok(Value::U16(*a)),
            Value::I32(a) => Ok(Value::U32(*a as u32)),
            Value::U32(a) => Ok(Value::U32(*a)),
            Value::I64(a) => Ok(Value::U64(*a as u64)),
            Value::U64(a) => Ok(Value::U64(*a)),
            Value::ILong(a) => Ok(Value::ULong(*a as u64)),
            Value::ULong(a) => Ok(Value::ULong(*a)),
            Value::ISize(a) => Ok(Value::USize(*a as usize)),
            Value::USize(a) => Ok(Value::USize(*a)),
            Value::F32(a) => Ok(Value::U32(a.to_bits())),
            Value::F64(a) => Ok(Value::U64(a.to_bits())),
            Value::Ptr(a) => Ok(Value::USize(*a as usize)),
            _ => Err(ErrorKind::BadOperand),
        }
    }

    pub fn op_len(&self) -> VResult {
        match self {
            Value::Array(arr, _) => Ok(Value::USize(arr.len())),
            _ => Err(ErrorKind::BadOperand),
        }
    }

    /// Raw address: the payload for scalars, the field or element storage
    /// for objects and arrays.
    pub fn op_ptr(&mut self) -> VResult {
        match self {
            Value::None => Ok(Value::null()),
            Value::Object(obj, _) => Ok(Value::Ptr(obj.fields_ptr() as *mut c_void)),
            Value::Array(arr, _) => Ok(Value::Ptr(arr.elems_ptr() as *mut c_void)),
            v => v.ffi_addr().map(Value::Ptr),
        }
    }

    /// A read-only alias: the same cown handle with the read bit set.
    pub fn op_read(&self) -> VResult {
        match self {
            Value::Cown { cown, .. } => {
                cown.inc();
                Ok(Value::Cown {
                    cown: *cown,
                    readonly: true,
                })
            }
            _ => Err(ErrorKind::BadOperand),
        }
    }

    pub fn op_e() -> Value {
        Value::F64(std::f64::consts::E)
    }

    pub fn op_pi() -> Value {
        Value::F64(std::f64::consts::PI)
    }

    pub fn op_inf() -> Value {
        Value::F64(f64::INFINITY)
    }

    pub fn op_nan() -> Value {
        Value::F64(f64::NAN)
    }

    /// Numeric cast across integer and float widths.
    pub fn convert(&self, to: ValueType) -> VResult {
        if !to.is_numeric() && to != ValueType::None {
            return Err(ErrorKind::BadConversion);
        }
        enum Num {
            I(i64),
            U(u64),
            F(f64),
        }
        let n = match self {
            Value::Bool(a) => Num::U(*a as u64),
            Value::I8(a) => Num::I(*a as i64),
            Value::I16(a) => Num::I(*a as i64),
            Value::I32(a) => Num::I(*a as i64),
            Value::I64(a) | Value::ILong(a) => Num::I(*a),
            Value::ISize(a) => Num::I(*a as i64),
            Value::U8(a) => Num::U(*a as u64),
            Value::U16(a) => Num::U(*a as u64),
            Value::U32(a) => Num::U(*a as u64),
            Value::U64(a) | Value::ULong(a) => Num::U(*a),
            Value::USize(a) => Num::U(*a as u64),
            Value::F32(a) => Num::F(*a as f64),
            Value::F64(a) => Num::F(*a),
            _ => return Err(ErrorKind::BadConversion),
        };
        macro_rules! cast {
            ($t:ty, $ctor:path) => {
                Ok($ctor(match n {
                    Num::I(v) => v as $t,
                    Num::U(v) => v as $t,
                    Num::F(v) => v as $t,
                }))
            };
        }
        match to {
            ValueType::None => Ok(Value::None),
            ValueType::Bool => Ok(Value::Bool(match n {
                Num::I(v) => v != 0,
                Num::U(v) => v != 0,
                Num::F(v) => v != 0.0,
            })),
            ValueType::I8 => cast!(i8, Value::I8),
            ValueType::I16 => cast!(i16, Value::I16),
            ValueType::I32 => cast!(i32, Value::I32),
            ValueType::I64 => cast!(i64, Value::I64),
            ValueType::ILong => cast!(i64, Value::ILong),
            ValueType::ISize => cast!(isize, Value::ISize),
            ValueType::U8 => cast!(u8, Value::U8),
            ValueType::U16 => cast!(u16, Value::U16),
            ValueType::U32 => cast!(u32, Value::U32),
            ValueType::U64 => cast!(u64, Value::U64),
            ValueType::ULong => cast!(u64, Value::ULong),
            ValueType::USize => cast!(usize, Value::USize),
            ValueType::F32 => cast!(f32, Value::F32),
            ValueType::F64 => cast!(f64, Value::F64),
            _ => Err(ErrorKind::BadConversion),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Invalid => write!(f, "invalid"),
            Value::None => write!(f, "none"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::ILong(v) => write!(f, "{v}"),
            Value::ULong(v) => write!(f, "{v}"),
            Value::ISize(v) => write!(f, "{v}"),
            Value::USize(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Ptr(v) => write!(f, "ptr {v:p}"),
            Value::Object(obj, _) => write!(f, "object@{:p}", obj.fields_ptr()),
            Value::Array(arr, _) => write!(f, "array[{}]@{:p}", arr.len(), arr.elems_ptr()),
            Value::Cown { cown, .. } => write!(f, "cown@{:p}", cown.as_raw()),
            Value::RegisterRef { index, .. } => write!(f, "ref r{index}"),
            Value::FieldRef { obj, field, .. } => {
                write!(f, "ref [{}] object@{:p}", field, obj.fields_ptr())
            }
            Value::ArrayRef { arr, index, .. } => {
                write!(f, "ref [{}] array@{:p}", index, arr.elems_ptr())
            }
            Value::CownRef { cown, .. } => write!(f, "ref cown@{:p}", cown.as_raw()),
            Value::Function(id) => write!(f, "function#{id}"),
            Value::Error(e) => write!(f, "{}", e.kind),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self} ({:?})", self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_invalid_and_zeroed() {
        assert!(Value::default().is_invalid());
        let zeroed: Value = unsafe { std::mem::zeroed() };
        assert!(zeroed.is_invalid());
    }

    #[test]
    fn binops_require_matching_tags() {
        let a = Value::I32(3);
        let b = Value::I32(4);
        assert!(matches!(a.op_add(&b), Ok(Value::I32(7))));
        assert_eq!(
            a.op_add(&Value::I64(4)).unwrap_err(),
            ErrorKind::MismatchedTypes
        );
        assert_eq!(
            Value::Bool(true).op_add(&Value::Bool(false)).unwrap_err(),
            ErrorKind::BadOperand
        );
    }

    #[test]
    fn division_by_zero_is_a_bad_operand() {
        assert_eq!(
            Value::I32(1).op_div(&Value::I32(0)).unwrap_err(),
            ErrorKind::BadOperand
        );
        // Float division by zero follows IEEE.
        assert!(matches!(
            Value::F64(1.0).op_div(&Value::F64(0.0)),
            Ok(Value::F64(v)) if v.is_infinite()
        ));
    }

    #[test]
    fn conversions_cross_widths() {
        assert!(matches!(
            Value::I32(-1).convert(ValueType::U8),
            Ok(Value::U8(255))
        ));
        assert!(matches!(
            Value::F64(3.7).convert(ValueType::I32),
            Ok(Value::I32(3))
        ));
        assert!(matches!(
            Value::U16(0).convert(ValueType::Bool),
            Ok(Value::Bool(false))
        ));
        assert_eq!(
            Value::None.convert(ValueType::I32).unwrap_err(),
            ErrorKind::BadConversion
        );
    }

    #[test]
    fn bits_and_float_ops() {
        assert!(matches!(
            Value::F32(1.0).op_bits(),
            Ok(Value::U32(0x3F80_0000))
        ));
        assert!(matches!(Value::F64(f64::NAN).op_isnan(), Ok(Value::Bool(true))));
        assert!(matches!(
            Value::I8(-5).op_abs(),
            Ok(Value::I8(5))
        ));
        assert_eq!(Value::U8(1).op_abs().unwrap_err(), ErrorKind::BadOperand);
    }
}
