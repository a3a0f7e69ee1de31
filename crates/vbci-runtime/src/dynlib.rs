// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Dynamic libraries and foreign symbols. Each symbol carries a libffi CIF
//! built from its declared parameter and return types; variadic symbols
//! extend the CIF with argument types discovered at the call site.

use std::cell::UnsafeCell;
use std::ffi::{c_void, CString};

use libffi::low;
use vbci_bytecode::{TypeId, ValueType};

use crate::error::ErrorKind;

/// An opened dynamic library. An empty path resolves symbols against the
/// host process itself, which is also where the built-in VM symbols live.
pub struct Dynlib {
    #[cfg(unix)]
    handle: *mut c_void,
    #[cfg(windows)]
    lib: Option<libloading::Library>,
}

unsafe impl Send for Dynlib {}
unsafe impl Sync for Dynlib {}

impl Dynlib {
    pub fn open(path: Option<&str>) -> Option<Dynlib> {
        #[cfg(unix)]
        {
            let handle = match path {
                Some(p) => {
                    let lib = unsafe { libloading::os::unix::Library::open(
                        Some(p),
                        libc::RTLD_LOCAL | libc::RTLD_NOW,
                    ) }
                    .ok()?;
                    lib.into_raw()
                }
                None => {
                    let lib = unsafe { libloading::os::unix::Library::open(
                        None::<&str>,
                        libc::RTLD_LOCAL | libc::RTLD_NOW,
                    ) }
                    .ok()?;
                    lib.into_raw()
                }
            };
            Some(Dynlib { handle })
        }
        #[cfg(windows)]
        {
            let lib = match path {
                Some(p) => Some(unsafe { libloading::Library::new(p) }.ok()?),
                None => None,
            };
            Some(Dynlib { lib })
        }
    }

    /// Resolve a symbol, optionally by version where the platform supports
    /// versioned lookup.
    pub fn symbol(&self, name: &str, version: Option<&str>) -> Option<*mut c_void> {
        #[cfg(unix)]
        {
            let cname = CString::new(name).ok()?;
            let ptr = unsafe {
                match version {
                    #[cfg(target_os = "linux")]
                    Some(v) => {
                        let cver = CString::new(v).ok()?;
                        libc::dlvsym(self.handle, cname.as_ptr(), cver.as_ptr())
                    }
                    #[cfg(not(target_os = "linux"))]
                    Some(_) => libc::dlsym(self.handle, cname.as_ptr()),
                    None => libc::dlsym(self.handle, cname.as_ptr()),
                }
            };
            if ptr.is_null() {
                None
            } else {
                Some(ptr)
            }
        }
        #[cfg(windows)]
        {
            let _ = version;
            let lib = self.lib.as_ref()?;
            let sym = unsafe { lib.get::<*mut c_void>(name.as_bytes()) }.ok()?;
            Some(unsafe { sym.into_raw().into_raw() as *mut c_void })
        }
    }
}

impl Drop for Dynlib {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            drop(libloading::os::unix::Library::from_raw(self.handle));
        }
    }
}

/// A prepared foreign function: code pointer, declared signature, CIF.
pub struct Symbol {
    name: String,
    fnptr: *mut c_void,
    param_types: Vec<TypeId>,
    param_vals: Vec<ValueType>,
    param_ffi: Vec<*mut low::ffi_type>,
    return_type: TypeId,
    return_vt: ValueType,
    return_ffi: *mut low::ffi_type,
    vararg: bool,
    cif: UnsafeCell<low::ffi_cif>,
}

unsafe impl Send for Symbol {}
unsafe impl Sync for Symbol {}

impl Symbol {
    pub fn new(
        name: String,
        fnptr: *mut c_void,
        params: Vec<(TypeId, ValueType, *mut low::ffi_type)>,
        return_type: TypeId,
        return_vt: ValueType,
        return_ffi: *mut low::ffi_type,
        vararg: bool,
    ) -> Symbol {
        let mut param_types = Vec::with_capacity(params.len());
        let mut param_vals = Vec::with_capacity(params.len());
        let mut param_ffi = Vec::with_capacity(params.len());
        for (t, vt, ffi) in params {
            param_types.push(t);
            param_vals.push(vt);
            param_ffi.push(ffi);
        }
        Symbol {
            name,
            fnptr,
            param_types,
            param_vals,
            param_ffi,
            return_type,
            return_vt,
            return_ffi,
            vararg,
            cif: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw_pointer(&self) -> *mut c_void {
        self.fnptr
    }

    pub fn params(&self) -> &[TypeId] {
        &self.param_types
    }

    pub fn param_vals(&self) -> &[ValueType] {
        &self.param_vals
    }

    pub fn ret(&self) -> TypeId {
        self.return_type
    }

    pub fn ret_val(&self) -> ValueType {
        self.return_vt
    }

    pub fn is_vararg(&self) -> bool {
        self.vararg
    }

    /// Build the CIF for the declared signature. Variadic symbols prepare
    /// per call instead, once the trailing types are known.
    pub fn prepare(&mut self) -> bool {
        if self.vararg {
            return true;
        }
        unsafe {
            low::prep_cif(
                self.cif.get(),
                low::ffi_abi_FFI_DEFAULT_ABI,
                self.param_ffi.len(),
                self.return_ffi,
                self.param_ffi.as_mut_ptr(),
            )
            .is_ok()
        }
    }

    /// Invoke with bound argument addresses; `varargs` carries the libffi
    /// types of any arguments beyond the declared parameters. Returns the
    /// raw 64-bit result, rewrapped by the caller using the return
    /// `ValueType`.
    pub fn call(
        &self,
        args: &mut [*mut c_void],
        varargs: &[*mut low::ffi_type],
    ) -> Result<u64, ErrorKind> {
        unsafe {
            if self.vararg {
                let mut all: Vec<*mut low::ffi_type> = self
                    .param_ffi
                    .iter()
                    .copied()
                    .chain(varargs.iter().copied())
                    .collect();
                let mut cif: low::ffi_cif = std::mem::zeroed();
                low::prep_cif_var(
                    &mut cif,
                    low::ffi_abi_FFI_DEFAULT_ABI,
                    self.param_ffi.len(),
                    all.len(),
                    self.return_ffi,
                    all.as_mut_ptr(),
                )
                .map_err(|_| ErrorKind::BadOperand)?;
                Ok(self.invoke(&mut cif, args))
            } else {
                debug_assert!(varargs.is_empty());
                Ok(self.invoke(&mut *self.cif.get(), args))
            }
        }
    }

    unsafe fn invoke(&self, cif: *mut low::ffi_cif, args: &mut [*mut c_void]) -> u64 {
        let code = low::CodePtr(self.fnptr);
        if self.return_vt == ValueType::None {
            low::call::<()>(cif, code, args.as_mut_ptr());
            0
        } else {
            low::call::<u64>(cif, code, args.as_mut_ptr())
        }
    }
}
