// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Built-in FFI symbols. The loader resolves an empty-path library's
//! symbols against this registry before consulting the dynamic linker, so
//! bytecode can reach the VM's own surface (printing, argv, async timers)
//! through the ordinary FFI opcodes.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::warn;

use vbci_bytecode::{TypeId, ValueType};

use crate::array::ArrPtr;
use crate::io::AsyncHandle;
use crate::location::Location;
use crate::value::Value;
use crate::vm::Vm;

// The extern "C" surface has no context parameter, so the bridge keeps the
// running VM in process-global storage, as the original loop did.
static VM: OnceLock<Arc<Vm>> = OnceLock::new();

pub fn install(vm: &Arc<Vm>) {
    VM.set(vm.clone()).ok();
}

fn vm() -> Option<&'static Arc<Vm>> {
    VM.get()
}

pub fn lookup(name: &str) -> Option<*mut c_void> {
    Some(match name {
        "vbci_print" => vbci_print as *mut c_void,
        "vbci_argv" => vbci_argv as *mut c_void,
        "vbci_async_timer" => vbci_async_timer as *mut c_void,
        "vbci_async_set_cb" => vbci_async_set_cb as *mut c_void,
        "vbci_async_close" => vbci_async_close as *mut c_void,
        _ => return None,
    })
}

extern "C" fn vbci_print(v: *mut Value) {
    if v.is_null() {
        return;
    }
    println!("{}", unsafe { &*v });
}

/// The program argv as an immortal array of u8 arrays (element pointer,
/// per the FFI array convention).
extern "C" fn vbci_argv() -> *mut u8 {
    static ARGV: OnceLock<usize> = OnceLock::new();
    let elems = ARGV.get_or_init(|| {
        let Some(vm) = vm() else { return 0 };
        let args = &vm.program.argv;
        let string_type = TypeId::prim(ValueType::U8).array_of();
        let outer = ArrPtr::alloc(
            Location::IMMORTAL,
            TypeId::DYN.array_of(),
            ValueType::Invalid,
            args.len(),
            std::mem::size_of::<Value>(),
        );
        for (i, arg) in args.iter().enumerate() {
            let s = ArrPtr::alloc(Location::IMMORTAL, string_type, ValueType::U8, arg.len(), 1);
            unsafe {
                std::ptr::copy_nonoverlapping(arg.as_ptr(), s.elems_ptr(), arg.len());
            }
            let addr = unsafe { outer.elems_ptr().add(i * std::mem::size_of::<Value>()) };
            Value::Array(s, false).write_addr(ValueType::Invalid, addr);
        }
        outer.elems_ptr() as usize
    });
    *elems as *mut u8
}

/// Arm a timer. `cb` must hold a function value; `arg` must be sendable.
/// Returns an opaque handle owning one external event source.
extern "C" fn vbci_async_timer(
    timeout_ms: u64,
    repeat_ms: u64,
    cb: *mut Value,
    arg: *mut Value,
) -> *mut c_void {
    let Some(vm) = vm() else {
        return std::ptr::null_mut();
    };
    let Some(func) = (unsafe { cb.as_ref().and_then(|v| v.function()) }) else {
        warn!("async timer requires a function callback");
        return std::ptr::null_mut();
    };
    let arg = unsafe {
        match arg.as_mut() {
            Some(v) if v.is_sendable() => v.take(),
            _ => Value::None,
        }
    };

    vm.scheduler.add_external_event_source();
    let handle = Arc::new(AsyncHandle::new(func, arg));
    vm.io.start_timer(
        vm.clone(),
        handle.clone(),
        Duration::from_millis(timeout_ms),
        Duration::from_millis(repeat_ms),
    );
    Arc::into_raw(handle) as *mut c_void
}

/// Rebind one of a handle's callback slots.
extern "C" fn vbci_async_set_cb(raw: *mut c_void, slot: u64, cb: *mut Value) -> bool {
    if raw.is_null() {
        return false;
    }
    let Some(func) = (unsafe { cb.as_ref().and_then(|v| v.function()) }) else {
        return false;
    };
    let handle = unsafe { &*(raw as *const AsyncHandle) };
    handle.set_callback(slot as usize, func);
    true
}

extern "C" fn vbci_async_close(raw: *mut c_void) {
    if raw.is_null() {
        return;
    }
    let Some(vm) = vm() else { return };
    let handle = unsafe { Arc::from_raw(raw as *const AsyncHandle) };
    vm.io.close(&handle);
    let mut arg = handle.arg.lock();
    arg.drop_reg(&vm.program);
    drop(arg);
    drop(handle);
    vm.scheduler.remove_external_event_source();
}
