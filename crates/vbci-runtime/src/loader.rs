// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Parses and validates a bytecode file into a [`Program`]. Malformed
//! files are rejected here with a [`LoadError`]; nothing invalid reaches
//! the interpreter.

use std::collections::HashMap;
use std::path::Path;

use libffi::low;
use tracing::{debug, error};
use vbci_bytecode::{
    Cursor, TypeId, ValueType, CURRENT_VERSION, MAGIC, MAIN_FUNC_ID, MAX_FIELDS, STRING_NONE,
    SYMBOL_FLAG_VARARG,
};

use crate::array::ArrPtr;
use crate::dynlib::{Dynlib, Symbol};
use crate::error::LoadError;
use crate::location::Location;
use crate::object::{ObjPtr, FIELDS_OFFSET};
use crate::program::{
    prim_ffi_type, Class, Field, Function, Program, ValueFfiType, NUM_PRIMITIVES,
};
use crate::value::Value;

pub fn load_file(path: &Path) -> Result<Program, LoadError> {
    let path_display = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path_display.clone(),
        source,
    })?;
    let program = parse(path, &bytes)?;
    debug!(
        functions = program.functions.len(),
        classes = program.classes.len(),
        symbols = program.symbols.len(),
        "loaded {path_display}"
    );
    Ok(program)
}

pub fn parse(path: &Path, bytes: &[u8]) -> Result<Program, LoadError> {
    let path_display = path.display().to_string();
    let malformed = |reason: &str| LoadError::Malformed {
        path: path_display.clone(),
        reason: reason.to_string(),
    };

    let mut c = Cursor::new(bytes);

    if c.u32_le().map_err(|_| malformed("header"))? != MAGIC {
        error!("{path_display}: does not start with the magic number");
        return Err(LoadError::BadMagic { path: path_display.clone() });
    }
    if c.u32_le().map_err(|_| malformed("header"))? != CURRENT_VERSION {
        error!("{path_display}: has an unknown version number");
        return Err(LoadError::BadVersion { path: path_display.clone() });
    }

    let debug_offset = c.u64_le().map_err(|_| malformed("header"))? as usize;
    if debug_offset != 0 && debug_offset >= bytes.len() {
        return Err(LoadError::BadDebugOffset { path: path_display.clone() });
    }

    // Functions.
    let function_count = c.u32_le().map_err(|_| malformed("function count"))?;
    if function_count == 0 {
        error!("{path_display}: has no functions");
        return Err(LoadError::NoFunctions { path: path_display.clone() });
    }
    let mut functions = Vec::with_capacity(function_count as usize);
    for id in 0..function_count {
        let packed = c.u32_le().map_err(|_| malformed("function header"))?;
        let label_count = (packed & 0xFF) as usize;
        let param_count = ((packed >> 8) & 0xFF) as usize;
        let registers = ((packed >> 16) & 0xFF) as usize;
        if label_count == 0 {
            return Err(malformed("function has no labels"));
        }
        let mut labels = Vec::with_capacity(label_count);
        for _ in 0..label_count {
            labels.push(c.u64_le().map_err(|_| malformed("label pc"))? as usize);
        }
        let debug_info = c.u64_le().map_err(|_| malformed("function debug info"))?;
        let return_type =
            TypeId::from_raw(c.u32_le().map_err(|_| malformed("return type"))?);
        let mut param_types = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            param_types.push(TypeId::from_raw(
                c.u32_le().map_err(|_| malformed("param type"))?,
            ));
        }
        functions.push(Function {
            id,
            labels,
            param_types,
            return_type,
            registers,
            debug_info,
        });
    }

    if !functions[MAIN_FUNC_ID as usize].param_types.is_empty() {
        error!("{path_display}: `main` must take zero parameters");
        return Err(LoadError::BadMainSignature { path: path_display.clone() });
    }

    // Primitive class method tables, one per primitive ValueType.
    let mut primitives = Vec::with_capacity(NUM_PRIMITIVES);
    for i in 0..NUM_PRIMITIVES {
        let methods = parse_method_table(&mut c, &functions, &path_display)?;
        let t = ValueType::try_from(i as u8).expect("primitive index");
        primitives.push(Class::new(TypeId::prim(t), Vec::new(), methods, 0));
    }

    // User classes.
    let class_count = c.u32_le().map_err(|_| malformed("class count"))?;
    let mut classes = Vec::with_capacity(class_count as usize);
    for index in 0..class_count {
        let debug_info = c.u64_le().map_err(|_| malformed("class debug info"))?;
        let field_count = c.u32_le().map_err(|_| malformed("field count"))? as usize;
        if field_count > MAX_FIELDS {
            error!("{path_display}: too many fields in class");
            return Err(LoadError::TooManyFields { path: path_display.clone() });
        }
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let name = c.u32_le().map_err(|_| malformed("field name"))?;
            let type_id = TypeId::from_raw(c.u32_le().map_err(|_| malformed("field type"))?);
            fields.push(Field {
                name,
                type_id,
                value_type: ValueType::Invalid,
                offset: 0,
                size: 0,
            });
        }
        let methods = parse_method_table(&mut c, &functions, &path_display)?;
        classes.push(Class::new(TypeId::class(index), fields, methods, debug_info));
    }

    // Interned strings.
    let string_count = c.u32_le().map_err(|_| malformed("string count"))?;
    let mut string_bytes = Vec::with_capacity(string_count as usize);
    for _ in 0..string_count {
        let len = c.u32_le().map_err(|_| malformed("string length"))? as usize;
        let data = c.bytes(len).map_err(|_| malformed("string data"))?;
        string_bytes.push(data.to_vec());
    }

    // FFI libraries and symbols.
    let lib_count = c.u32_le().map_err(|_| malformed("lib count"))?;
    let mut libs = Vec::with_capacity(lib_count as usize);
    let mut symbols = Vec::new();
    let value_ffi = ValueFfiType::new();
    for _ in 0..lib_count {
        let path_sid = c.u32_le().map_err(|_| malformed("lib path"))?;
        let lib_path = string_ref(&string_bytes, path_sid);
        let symbol_count = c.u32_le().map_err(|_| malformed("symbol count"))?;

        let lib = Dynlib::open(lib_path.as_deref()).ok_or_else(|| LoadError::BadLibrary {
            path: path_display.clone(),
            lib: lib_path.clone().unwrap_or_default(),
        })?;

        for _ in 0..symbol_count {
            let name_sid = c.u32_le().map_err(|_| malformed("symbol name"))?;
            let version_sid = c.u32_le().map_err(|_| malformed("symbol version"))?;
            let flags = c.u32_le().map_err(|_| malformed("symbol flags"))?;
            let return_type =
                TypeId::from_raw(c.u32_le().map_err(|_| malformed("symbol return"))?);
            let param_count = c.u32_le().map_err(|_| malformed("symbol params"))? as usize;
            let mut params = Vec::with_capacity(param_count);
            for _ in 0..param_count {
                params.push(TypeId::from_raw(
                    c.u32_le().map_err(|_| malformed("symbol param"))?,
                ));
            }

            let name = string_ref(&string_bytes, name_sid).unwrap_or_default();
            let version = string_ref(&string_bytes, version_sid);

            // Built-in VM symbols shadow the dynamic namespace.
            let fnptr = crate::builtins::lookup(&name)
                .or_else(|| lib.symbol(&name, version.as_deref()))
                .ok_or_else(|| LoadError::BadSymbol {
                    path: path_display.clone(),
                    symbol: name.clone(),
                })?;

            let param_reps = params
                .iter()
                .map(|&t| symbol_param_rep(t))
                .collect::<Vec<_>>();
            let (ret_vt, ret_ffi) = symbol_return_rep(return_type);

            let mut symbol = Symbol::new(
                name.clone(),
                fnptr,
                param_reps,
                return_type,
                ret_vt,
                ret_ffi,
                flags & SYMBOL_FLAG_VARARG != 0,
            );
            if !symbol.prepare() {
                return Err(LoadError::BadSymbol {
                    path: path_display.clone(),
                    symbol: name,
                });
            }
            symbols.push(symbol);
        }
        libs.push(lib);
    }

    // Globals: primitive constants set at load time.
    let global_count = c.u32_le().map_err(|_| malformed("global count"))?;
    let mut globals = Vec::with_capacity(global_count as usize);
    for _ in 0..global_count {
        let t = c.u8().map_err(|_| malformed("global type"))?;
        let bits = c.u64_le().map_err(|_| malformed("global bits"))?;
        let t = ValueType::try_from(t).map_err(|_| malformed("global type"))?;
        globals.push(Value::from_ffi(t, bits));
    }

    // Code blob.
    let code_size = c.u64_le().map_err(|_| malformed("code size"))? as usize;
    let code = c
        .bytes(code_size)
        .map_err(|_| malformed("code blob"))?
        .to_vec();
    for f in &functions {
        for &pc in &f.labels {
            if pc >= code.len() {
                return Err(malformed("label out of range"));
            }
        }
    }

    // Debug blob.
    let mut debug_strings = Vec::new();
    if debug_offset != 0 {
        let mut d = Cursor::new(bytes);
        d.seek(debug_offset);
        let count = d.u32_le().map_err(|_| malformed("debug count"))?;
        for _ in 0..count {
            let len = d.u32_le().map_err(|_| malformed("debug string"))? as usize;
            let data = d.bytes(len).map_err(|_| malformed("debug string"))?;
            debug_strings.push(String::from_utf8_lossy(data).into_owned());
        }
    }

    let mut program = Program {
        path: path.to_path_buf(),
        code,
        functions,
        primitives,
        classes,
        globals,
        strings: Vec::new(),
        string_bytes,
        symbols,
        libs,
        debug_strings,
        argv: std::env::args().collect(),
        value_ffi,
    };

    layout_classes(&mut program, &path_display)?;
    validate_finalizers(&program, &path_display)?;
    intern_strings(&mut program);

    Ok(program)
}

fn parse_method_table(
    c: &mut Cursor<'_>,
    functions: &[Function],
    path_display: &str,
) -> Result<HashMap<u32, u32>, LoadError> {
    let malformed = |reason: &str| LoadError::Malformed {
        path: path_display.to_string(),
        reason: reason.to_string(),
    };
    let count = c.u32_le().map_err(|_| malformed("method count"))?;
    let mut methods = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let method_id = c.u32_le().map_err(|_| malformed("method id"))?;
        let func_id = c.u32_le().map_err(|_| malformed("method function"))?;
        if func_id as usize >= functions.len() {
            return Err(malformed("method names unknown function"));
        }
        methods.insert(method_id, func_id);
    }
    Ok(methods)
}

fn string_ref(strings: &[Vec<u8>], id: u32) -> Option<String> {
    if id == STRING_NONE {
        return None;
    }
    strings
        .get(id as usize)
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

/// Ask libffi to lay the fields out as a C struct, so objects stay
/// ABI-compatible with foreign code. Empty classes get an immortal
/// singleton instead of a layout.
fn layout_classes(program: &mut Program, path_display: &str) -> Result<(), LoadError> {
    for index in 0..program.classes.len() {
        if program.classes[index].fields.is_empty() {
            program.classes[index].size = FIELDS_OFFSET;
            let singleton = ObjPtr::alloc(&program.classes[index], Location::IMMORTAL);
            program.classes[index].singleton = Some(singleton);
            continue;
        }

        let mut reps = Vec::with_capacity(program.classes[index].fields.len());
        for f in &program.classes[index].fields {
            let (vt, ffi, _stride) =
                program
                    .layout_type_id(f.type_id)
                    .map_err(|_| LoadError::BadClassLayout {
                        path: path_display.to_string(),
                        class: index as u32,
                    })?;
            reps.push((vt, ffi));
        }

        let mut elements: Vec<*mut low::ffi_type> =
            reps.iter().map(|&(_, ffi)| ffi).collect();
        elements.push(std::ptr::null_mut());
        let mut struct_type = low::ffi_type {
            size: 0,
            alignment: 0,
            type_: libffi::raw::FFI_TYPE_STRUCT as u16,
            elements: elements.as_mut_ptr(),
        };
        let mut offsets = vec![0usize; reps.len()];
        let status = unsafe {
            libffi::raw::ffi_get_struct_offsets(
                low::ffi_abi_FFI_DEFAULT_ABI,
                &mut struct_type,
                offsets.as_mut_ptr(),
            )
        };
        if status != libffi::raw::ffi_status_FFI_OK {
            return Err(LoadError::BadClassLayout {
                path: path_display.to_string(),
                class: index as u32,
            });
        }

        let cls = &mut program.classes[index];
        cls.size = FIELDS_OFFSET + struct_type.size;
        for (i, f) in cls.fields.iter_mut().enumerate() {
            f.value_type = reps[i].0;
            f.offset = offsets[i];
            f.size = unsafe { (*reps[i].1).size };
        }
    }
    Ok(())
}

fn validate_finalizers(program: &Program, path_display: &str) -> Result<(), LoadError> {
    let all = program.classes.iter().chain(program.primitives.iter());
    for cls in all {
        if let Some(func) = cls.finalizer() {
            if program.functions[func as usize].param_types.len() != 1 {
                error!("{path_display}: finalizer must have one parameter");
                return Err(LoadError::BadFinalizer {
                    path: path_display.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Intern each string as an immortal u8 array; `String` opcodes and symbol
/// lookups share these.
fn intern_strings(program: &mut Program) {
    let type_id = TypeId::prim(ValueType::U8).array_of();
    program.strings = program
        .string_bytes
        .iter()
        .map(|bytes| {
            let arr = ArrPtr::alloc(
                Location::IMMORTAL,
                type_id,
                ValueType::U8,
                bytes.len(),
                1,
            );
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), arr.elems_ptr(), bytes.len());
            }
            arr
        })
        .collect();
}

fn symbol_param_rep(t: TypeId) -> (TypeId, ValueType, *mut low::ffi_type) {
    if let Some(p) = t.as_primitive() {
        if let Some(ffi) = prim_ffi_type(p) {
            return (t, p, ffi);
        }
    }
    // Objects, arrays, cowns and dynamically-typed parameters all travel
    // as pointers; dynamic ones point at the whole boxed Value.
    let ffi = unsafe { std::ptr::addr_of_mut!(low::types::pointer) };
    let vt = if t.as_class().is_some() {
        ValueType::Object
    } else if t.is_array() {
        ValueType::Array
    } else if t.is_cown() {
        ValueType::Cown
    } else {
        ValueType::Invalid
    };
    (t, vt, ffi)
}

fn symbol_return_rep(t: TypeId) -> (ValueType, *mut low::ffi_type) {
    if let Some(p) = t.as_primitive() {
        if let Some(ffi) = prim_ffi_type(p) {
            return (p, ffi);
        }
    }
    let ffi = unsafe { std::ptr::addr_of_mut!(low::types::pointer) };
    let vt = if t.as_class().is_some() {
        ValueType::Object
    } else if t.is_array() {
        ValueType::Array
    } else {
        ValueType::Ptr
    };
    (vt, ffi)
}
