// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Assembles program files byte by byte. The compiler that normally emits
//! these files lives outside this repository; the builder exists so loader
//! and interpreter tests can state literal programs.

use crate::format::*;
use crate::opcode::Op;
use crate::type_id::TypeId;
use crate::value_type::{ValueType, NUM_PRIMITIVE_CLASSES};

struct FunctionDef {
    labels: Vec<u64>,
    params: Vec<TypeId>,
    registers: u8,
    return_type: TypeId,
    debug_info: u64,
}

struct ClassDef {
    fields: Vec<(u32, TypeId)>,
    methods: Vec<(u32, u32)>,
    debug_info: u64,
}

struct SymbolDef {
    name: u32,
    version: u32,
    flags: u32,
    params: Vec<TypeId>,
    return_type: TypeId,
}

struct LibDef {
    path: u32,
    symbols: Vec<SymbolDef>,
}

/// Builds a bytecode file in memory.
pub struct BytecodeBuilder {
    functions: Vec<FunctionDef>,
    primitive_methods: Vec<Vec<(u32, u32)>>,
    classes: Vec<ClassDef>,
    strings: Vec<Vec<u8>>,
    libs: Vec<LibDef>,
    globals: Vec<(ValueType, u64)>,
    debug_strings: Vec<String>,
    code: Vec<u8>,
    next_symbol: u32,
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeBuilder {
    pub fn new() -> BytecodeBuilder {
        BytecodeBuilder {
            functions: Vec::new(),
            primitive_methods: vec![Vec::new(); NUM_PRIMITIVE_CLASSES],
            classes: Vec::new(),
            strings: Vec::new(),
            libs: Vec::new(),
            globals: Vec::new(),
            debug_strings: Vec::new(),
            code: Vec::new(),
            next_symbol: 0,
        }
    }

    /// Declare a function; code is attached later through [`Self::label`].
    pub fn declare_function(
        &mut self,
        params: &[TypeId],
        return_type: TypeId,
        registers: u8,
    ) -> u32 {
        self.functions.push(FunctionDef {
            labels: Vec::new(),
            params: params.to_vec(),
            registers,
            return_type,
            debug_info: 0,
        });
        (self.functions.len() - 1) as u32
    }

    /// Mark the current code position as the next label of `func`. The
    /// first label of a function is its entry point.
    pub fn label(&mut self, func: u32) -> &mut Self {
        let pc = self.code.len() as u64;
        self.functions[func as usize].labels.push(pc);
        self
    }

    pub fn add_class(&mut self, fields: &[(u32, TypeId)], methods: &[(u32, u32)]) -> TypeId {
        self.classes.push(ClassDef {
            fields: fields.to_vec(),
            methods: methods.to_vec(),
            debug_info: 0,
        });
        TypeId::class((self.classes.len() - 1) as u32)
    }

    pub fn add_primitive_method(&mut self, t: ValueType, method_id: u32, func_id: u32) {
        self.primitive_methods[t as usize].push((method_id, func_id));
    }

    pub fn add_string(&mut self, bytes: &[u8]) -> u32 {
        self.strings.push(bytes.to_vec());
        (self.strings.len() - 1) as u32
    }

    pub fn add_global(&mut self, t: ValueType, bits: u64) -> u32 {
        self.globals.push((t, bits));
        (self.globals.len() - 1) as u32
    }

    /// Declare a dynamic library; `None` resolves against the host process.
    pub fn add_lib(&mut self, path: Option<&str>) -> u32 {
        let path = match path {
            Some(p) => self.add_string(p.as_bytes()),
            None => STRING_NONE,
        };
        self.libs.push(LibDef {
            path,
            symbols: Vec::new(),
        });
        (self.libs.len() - 1) as u32
    }

    /// Declare a symbol of `lib`; returns the program-wide symbol id.
    pub fn add_symbol(
        &mut self,
        lib: u32,
        name: &str,
        version: Option<&str>,
        params: &[TypeId],
        return_type: TypeId,
        vararg: bool,
    ) -> u32 {
        let name = self.add_string(name.as_bytes());
        let version = match version {
            Some(v) => self.add_string(v.as_bytes()),
            None => STRING_NONE,
        };
        self.libs[lib as usize].symbols.push(SymbolDef {
            name,
            version,
            flags: if vararg { SYMBOL_FLAG_VARARG } else { 0 },
            params: params.to_vec(),
            return_type,
        });
        let id = self.next_symbol;
        self.next_symbol += 1;
        id
    }

    /// Intern a debug string and return its 1-based index.
    pub fn add_debug_string(&mut self, s: &str) -> u64 {
        self.debug_strings.push(s.to_string());
        self.debug_strings.len() as u64
    }

    pub fn set_function_debug(&mut self, func: u32, debug_info: u64) {
        self.functions[func as usize].debug_info = debug_info;
    }

    // Instruction emission. Operands are chained after the opcode.

    pub fn op(&mut self, op: Op) -> &mut Self {
        leb128::write::unsigned(&mut self.code, op as u64).unwrap();
        self
    }

    pub fn u(&mut self, v: u64) -> &mut Self {
        leb128::write::unsigned(&mut self.code, v).unwrap();
        self
    }

    pub fn s(&mut self, v: i64) -> &mut Self {
        leb128::write::signed(&mut self.code, v).unwrap();
        self
    }

    pub fn vt(&mut self, t: ValueType) -> &mut Self {
        self.u(t as u64)
    }

    pub fn ty(&mut self, t: TypeId) -> &mut Self {
        self.u(t.raw() as u64)
    }

    /// Emit `Const dst <i32 literal>`.
    pub fn const_i32(&mut self, dst: u64, v: i32) -> &mut Self {
        self.op(Op::Const).u(dst).vt(ValueType::I32).s(v as i64)
    }

    /// Emit `Const dst <f64 literal>`; float literals travel as raw bits.
    pub fn const_f64(&mut self, dst: u64, v: f64) -> &mut Self {
        self.op(Op::Const).u(dst).vt(ValueType::F64).u(v.to_bits())
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
        // Debug offset is patched once the size of everything before the
        // blob is known.
        let debug_offset_pos = out.len();
        out.extend_from_slice(&0u64.to_le_bytes());

        out.extend_from_slice(&(self.functions.len() as u32).to_le_bytes());
        for f in &self.functions {
            assert!(!f.labels.is_empty(), "function with no labels");
            let packed = (f.labels.len() as u32)
                | ((f.params.len() as u32) << 8)
                | ((f.registers as u32) << 16);
            out.extend_from_slice(&packed.to_le_bytes());
            for pc in &f.labels {
                out.extend_from_slice(&pc.to_le_bytes());
            }
            out.extend_from_slice(&f.debug_info.to_le_bytes());
            out.extend_from_slice(&f.return_type.raw().to_le_bytes());
            for p in &f.params {
                out.extend_from_slice(&p.raw().to_le_bytes());
            }
        }

        for methods in &self.primitive_methods {
            write_method_table(&mut out, methods);
        }

        out.extend_from_slice(&(self.classes.len() as u32).to_le_bytes());
        for c in &self.classes {
            out.extend_from_slice(&c.debug_info.to_le_bytes());
            out.extend_from_slice(&(c.fields.len() as u32).to_le_bytes());
            for (name, ty) in &c.fields {
                out.extend_from_slice(&name.to_le_bytes());
                out.extend_from_slice(&ty.raw().to_le_bytes());
            }
            write_method_table(&mut out, &c.methods);
        }

        out.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        for s in &self.strings {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s);
        }

        out.extend_from_slice(&(self.libs.len() as u32).to_le_bytes());
        for lib in &self.libs {
            out.extend_from_slice(&lib.path.to_le_bytes());
            out.extend_from_slice(&(lib.symbols.len() as u32).to_le_bytes());
            for sym in &lib.symbols {
                out.extend_from_slice(&sym.name.to_le_bytes());
                out.extend_from_slice(&sym.version.to_le_bytes());
                out.extend_from_slice(&sym.flags.to_le_bytes());
                out.extend_from_slice(&sym.return_type.raw().to_le_bytes());
                out.extend_from_slice(&(sym.params.len() as u32).to_le_bytes());
                for p in &sym.params {
                    out.extend_from_slice(&p.raw().to_le_bytes());
                }
            }
        }

        out.extend_from_slice(&(self.globals.len() as u32).to_le_bytes());
        for (t, bits) in &self.globals {
            out.push(*t as u8);
            out.extend_from_slice(&bits.to_le_bytes());
        }

        out.extend_from_slice(&(self.code.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.code);

        if !self.debug_strings.is_empty() {
            let debug_offset = out.len() as u64;
            out[debug_offset_pos..debug_offset_pos + 8]
                .copy_from_slice(&debug_offset.to_le_bytes());
            out.extend_from_slice(&(self.debug_strings.len() as u32).to_le_bytes());
            for s in &self.debug_strings {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }

        out
    }
}

fn write_method_table(out: &mut Vec<u8>, methods: &[(u32, u32)]) {
    out.extend_from_slice(&(methods.len() as u32).to_le_bytes());
    for (method, func) in methods {
        out.extend_from_slice(&method.to_le_bytes());
        out.extend_from_slice(&func.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;

    #[test]
    fn minimal_program_header() {
        let mut b = BytecodeBuilder::new();
        let main = b.declare_function(&[], TypeId::prim(ValueType::I32), 1);
        b.label(main);
        b.const_i32(0, 7);
        b.op(Op::Return).u(0);

        let bytes = b.finish();
        let mut c = Cursor::new(&bytes);
        assert_eq!(c.u32_le().unwrap(), MAGIC);
        assert_eq!(c.u32_le().unwrap(), CURRENT_VERSION);
        assert_eq!(c.u64_le().unwrap(), 0); // no debug blob
        assert_eq!(c.u32_le().unwrap(), 1); // one function
        let packed = c.u32_le().unwrap();
        assert_eq!(packed & 0xFF, 1); // one label
        assert_eq!((packed >> 8) & 0xFF, 0); // no params
        assert_eq!((packed >> 16) & 0xFF, 1); // one register
    }
}
