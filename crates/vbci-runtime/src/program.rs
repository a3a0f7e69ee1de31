// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The loaded program: functions, classes, globals, interned strings, FFI
//! symbols and debug info. Immortal once loaded; every interpreter thread
//! shares one `Arc<Program>`.

use std::collections::HashMap;
use std::path::PathBuf;

use libffi::low;
use vbci_bytecode::{TypeId, ValueType, FINAL_METHOD_ID, NUM_PRIMITIVE_CLASSES};

use crate::array::ArrPtr;
use crate::dynlib::{Dynlib, Symbol};
use crate::error::{ErrorInfo, ErrorKind};
use crate::object::ObjPtr;
use crate::value::Value;

pub struct Function {
    pub id: u32,
    /// Byte offsets into the code blob; label 0 is the entry point.
    pub labels: Vec<usize>,
    pub param_types: Vec<TypeId>,
    pub return_type: TypeId,
    pub registers: usize,
    pub debug_info: u64,
}

pub struct Field {
    pub name: u32,
    pub type_id: TypeId,
    pub value_type: ValueType,
    pub offset: usize,
    pub size: usize,
}

pub struct Class {
    pub type_id: TypeId,
    /// Total allocation size in bytes, header included.
    pub size: usize,
    pub fields: Vec<Field>,
    field_map: HashMap<u32, u32>,
    methods: HashMap<u32, u32>,
    finalizer: Option<u32>,
    pub singleton: Option<ObjPtr>,
    pub debug_info: u64,
}

impl Class {
    pub fn new(
        type_id: TypeId,
        fields: Vec<Field>,
        methods: HashMap<u32, u32>,
        debug_info: u64,
    ) -> Class {
        let field_map = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name, i as u32))
            .collect();
        let finalizer = methods.get(&FINAL_METHOD_ID).copied();
        Class {
            type_id,
            size: 0,
            fields,
            field_map,
            methods,
            finalizer,
            singleton: None,
            debug_info,
        }
    }

    pub fn field_index(&self, name: u32) -> Option<u32> {
        self.field_map.get(&name).copied()
    }

    pub fn method(&self, method_id: u32) -> Option<u32> {
        self.methods.get(&method_id).copied()
    }

    pub fn finalizer(&self) -> Option<u32> {
        self.finalizer
    }
}

/// The libffi rendition of a boxed `Value` slot, used to lay out
/// dynamically-typed fields inside C-compatible structs.
pub struct ValueFfiType {
    _elements: Box<[*mut low::ffi_type]>,
    ty: Box<low::ffi_type>,
}

unsafe impl Send for ValueFfiType {}
unsafe impl Sync for ValueFfiType {}

impl ValueFfiType {
    pub fn new() -> ValueFfiType {
        let words = std::mem::size_of::<Value>().div_ceil(8);
        let mut elements: Vec<*mut low::ffi_type> = (0..words)
            .map(|_| unsafe { std::ptr::addr_of_mut!(low::types::uint64) })
            .collect();
        elements.push(std::ptr::null_mut());
        let mut elements = elements.into_boxed_slice();
        let ty = Box::new(low::ffi_type {
            size: std::mem::size_of::<Value>(),
            alignment: std::mem::align_of::<Value>() as u16,
            type_: libffi::raw::FFI_TYPE_STRUCT as u16,
            elements: elements.as_mut_ptr(),
        });
        ValueFfiType {
            _elements: elements,
            ty,
        }
    }

    pub fn as_ptr(&self) -> *mut low::ffi_type {
        self.ty.as_ref() as *const low::ffi_type as *mut low::ffi_type
    }
}

impl Default for ValueFfiType {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Program {
    pub path: PathBuf,
    pub code: Vec<u8>,
    pub functions: Vec<Function>,
    pub primitives: Vec<Class>,
    pub classes: Vec<Class>,
    pub globals: Vec<Value>,
    pub strings: Vec<ArrPtr>,
    pub string_bytes: Vec<Vec<u8>>,
    pub symbols: Vec<Symbol>,
    pub libs: Vec<Dynlib>,
    pub debug_strings: Vec<String>,
    pub argv: Vec<String>,
    pub value_ffi: ValueFfiType,
}

// The program is frozen after load; interned strings are immortal arrays.
unsafe impl Send for Program {}
unsafe impl Sync for Program {}

impl Program {
    pub fn function(&self, id: u32) -> Result<&Function, ErrorKind> {
        self.functions
            .get(id as usize)
            .ok_or(ErrorKind::UnknownFunction)
    }

    pub fn cls(&self, index: u32) -> Result<&Class, ErrorKind> {
        self.classes.get(index as usize).ok_or(ErrorKind::BadType)
    }

    pub fn primitive_cls(&self, t: ValueType) -> &Class {
        debug_assert!(t.is_primitive());
        &self.primitives[t as usize]
    }

    /// The class for a type id, for dynamic dispatch.
    pub fn cls_for_type(&self, t: TypeId) -> Result<&Class, ErrorKind> {
        if let Some(p) = t.as_primitive() {
            return Ok(self.primitive_cls(p));
        }
        if let Some(c) = t.as_class() {
            return self.cls(c);
        }
        Err(ErrorKind::BadMethodTarget)
    }

    pub fn global(&self, id: u32) -> Result<&Value, ErrorKind> {
        self.globals
            .get(id as usize)
            .ok_or(ErrorKind::UnknownGlobal)
    }

    pub fn string(&self, id: u32) -> Result<ArrPtr, ErrorKind> {
        self.strings
            .get(id as usize)
            .copied()
            .ok_or(ErrorKind::UnknownGlobal)
    }

    pub fn symbol(&self, id: u32) -> Result<&Symbol, ErrorKind> {
        self.symbols
            .get(id as usize)
            .ok_or(ErrorKind::UnknownFunction)
    }

    pub fn field_type_id(&self, class_index: u32, field: u32) -> Option<TypeId> {
        self.classes
            .get(class_index as usize)?
            .fields
            .get(field as usize)
            .map(|f| f.type_id)
    }

    /// Answers "is `a` a subtype of `b`".
    pub fn subtype(&self, a: TypeId, b: TypeId) -> bool {
        a.subtype_of(b)
    }

    pub fn is_array(&self, t: TypeId) -> bool {
        t.is_array()
    }

    pub fn unarray(&self, t: TypeId) -> TypeId {
        t.unmod()
    }

    pub fn ref_of(&self, t: TypeId) -> TypeId {
        t.ref_of()
    }

    /// The storage representation of an element or field type: the runtime
    /// tag the slot decodes through, its libffi type, and its stride.
    pub fn layout_type_id(
        &self,
        t: TypeId,
    ) -> Result<(ValueType, *mut low::ffi_type, usize), ErrorKind> {
        unsafe {
            if let Some(p) = t.as_primitive() {
                let ffi = prim_ffi_type(p).ok_or(ErrorKind::UnknownPrimitiveType)?;
                return Ok((p, ffi, (*ffi).size.max(1)));
            }
            if t.as_class().is_some() {
                let ffi = std::ptr::addr_of_mut!(low::types::pointer);
                return Ok((ValueType::Object, ffi, (*ffi).size));
            }
            if t.is_array() {
                let ffi = std::ptr::addr_of_mut!(low::types::pointer);
                return Ok((ValueType::Array, ffi, (*ffi).size));
            }
            if t.is_cown() {
                let ffi = std::ptr::addr_of_mut!(low::types::pointer);
                return Ok((ValueType::Cown, ffi, (*ffi).size));
            }
            // dyn, refs, anything else: a whole boxed Value.
            Ok((
                ValueType::Invalid,
                self.value_ffi.as_ptr(),
                std::mem::size_of::<Value>(),
            ))
        }
    }

    pub fn debug_string(&self, index: u64) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.debug_strings
            .get((index - 1) as usize)
            .map(String::as_str)
    }

    pub fn function_name(&self, id: u32) -> String {
        self.functions
            .get(id as usize)
            .and_then(|f| self.debug_string(f.debug_info))
            .map(str::to_string)
            .unwrap_or_else(|| format!("function#{id}"))
    }

    /// Render a trap with whatever debug info the file carried.
    pub fn render_error(&self, info: &ErrorInfo) -> String {
        if info.func == u32::MAX {
            return format!("{}", info.kind);
        }
        format!(
            "{}\n  in {} at pc {}",
            info.kind,
            self.function_name(info.func),
            info.pc
        )
    }
}

/// The static libffi type for a primitive.
pub fn prim_ffi_type(t: ValueType) -> Option<*mut low::ffi_type> {
    use std::ptr::addr_of_mut;
    unsafe {
        Some(match t {
            ValueType::None => addr_of_mut!(low::types::void),
            ValueType::Bool => addr_of_mut!(low::types::uint8),
            ValueType::I8 => addr_of_mut!(low::types::sint8),
            ValueType::I16 => addr_of_mut!(low::types::sint16),
            ValueType::I32 => addr_of_mut!(low::types::sint32),
            ValueType::I64 => addr_of_mut!(low::types::sint64),
            ValueType::U8 => addr_of_mut!(low::types::uint8),
            ValueType::U16 => addr_of_mut!(low::types::uint16),
            ValueType::U32 => addr_of_mut!(low::types::uint32),
            ValueType::U64 => addr_of_mut!(low::types::uint64),
            ValueType::ILong => {
                if std::mem::size_of::<libc::c_long>() == 4 {
                    addr_of_mut!(low::types::sint32)
                } else {
                    addr_of_mut!(low::types::sint64)
                }
            }
            ValueType::ULong => {
                if std::mem::size_of::<libc::c_ulong>() == 4 {
                    addr_of_mut!(low::types::uint32)
                } else {
                    addr_of_mut!(low::types::uint64)
                }
            }
            ValueType::ISize => {
                if std::mem::size_of::<isize>() == 4 {
                    addr_of_mut!(low::types::sint32)
                } else {
                    addr_of_mut!(low::types::sint64)
                }
            }
            ValueType::USize => {
                if std::mem::size_of::<usize>() == 4 {
                    addr_of_mut!(low::types::uint32)
                } else {
                    addr_of_mut!(low::types::uint64)
                }
            }
            ValueType::F32 => addr_of_mut!(low::types::float),
            ValueType::F64 => addr_of_mut!(low::types::double),
            ValueType::Ptr => addr_of_mut!(low::types::pointer),
            _ => return None,
        })
    }
}

/// Number of primitive classes; re-exported for the loader.
pub const NUM_PRIMITIVES: usize = NUM_PRIMITIVE_CLASSES;
