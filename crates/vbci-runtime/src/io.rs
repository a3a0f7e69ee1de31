// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The event-loop bridge: a dedicated OS thread running a current-thread
//! tokio runtime. Async handles created through the built-in FFI surface
//! register here; each live handle owns one external event source against
//! the scheduler, so the runtime refuses to exit while IO is pending.
//! Callbacks re-enter the VM synchronously as scheduled work items.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::thread::Thread;
use crate::value::Value;
use crate::vm::Vm;

/// A C-style async handle: an argument plus up to four callback function
/// slots (slot 0 is the primary completion callback; the rest are wired by
/// handle-specific setters). The guest sees it as an opaque pointer.
pub struct AsyncHandle {
    pub callbacks: [Mutex<Option<u32>>; 4],
    pub arg: Mutex<Value>,
}

impl AsyncHandle {
    pub fn new(primary: u32, arg: Value) -> AsyncHandle {
        AsyncHandle {
            callbacks: [
                Mutex::new(Some(primary)),
                Mutex::new(None),
                Mutex::new(None),
                Mutex::new(None),
            ],
            arg: Mutex::new(arg),
        }
    }

    pub fn set_callback(&self, slot: usize, func: u32) {
        if let Some(cb) = self.callbacks.get(slot) {
            *cb.lock() = Some(func);
        }
    }
}

enum Cmd {
    StartTimer {
        vm: Arc<Vm>,
        handle: Arc<AsyncHandle>,
        timeout: Duration,
        repeat: Duration,
    },
    Close {
        handle: usize,
    },
    Shutdown,
}

pub struct EventLoop {
    cmd: mpsc::UnboundedSender<Cmd>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl EventLoop {
    pub fn start() -> EventLoop {
        // Broken-pipe writes surface as errors, not signals.
        #[cfg(unix)]
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let (cmd, rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name("vbci-io".to_string())
            .spawn(move || run_loop(rx))
            .expect("failed to spawn event loop thread");
        EventLoop {
            cmd,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Arm a timer for `handle`. A zero repeat fires once.
    pub fn start_timer(
        &self,
        vm: Arc<Vm>,
        handle: Arc<AsyncHandle>,
        timeout: Duration,
        repeat: Duration,
    ) {
        self.cmd
            .send(Cmd::StartTimer {
                vm,
                handle,
                timeout,
                repeat,
            })
            .ok();
    }

    pub fn close(&self, handle: &Arc<AsyncHandle>) {
        self.cmd
            .send(Cmd::Close {
                handle: Arc::as_ptr(handle) as usize,
            })
            .ok();
    }

    pub fn stop(&self) {
        self.cmd.send(Cmd::Shutdown).ok();
        if let Some(thread) = self.thread.lock().take() {
            thread.join().ok();
        }
    }
}

fn run_loop(mut rx: mpsc::UnboundedReceiver<Cmd>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build event loop runtime");

    runtime.block_on(async move {
        let mut tasks: HashMap<usize, tokio::task::JoinHandle<()>> = HashMap::new();
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Cmd::StartTimer {
                    vm,
                    handle,
                    timeout,
                    repeat,
                } => {
                    let key = Arc::as_ptr(&handle) as usize;
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        fire(&vm, &handle);
                        if !repeat.is_zero() {
                            let mut tick = tokio::time::interval(repeat);
                            // The first interval tick fires immediately.
                            tick.tick().await;
                            loop {
                                tick.tick().await;
                                fire(&vm, &handle);
                            }
                        }
                    });
                    tasks.insert(key, task);
                }
                Cmd::Close { handle } => {
                    if let Some(task) = tasks.remove(&handle) {
                        task.abort();
                    }
                }
                Cmd::Shutdown => {
                    for (_, task) in tasks.drain() {
                        task.abort();
                    }
                    break;
                }
            }
        }
        debug!("event loop stopped");
    });
}

/// Post the handle's primary callback back into the VM as a work item.
fn fire(vm: &Arc<Vm>, handle: &Arc<AsyncHandle>) {
    let Some(func) = *handle.callbacks[0].lock() else {
        return;
    };
    let arg = handle.arg.lock().copy_reg();
    let vm = vm.clone();
    vm.scheduler.clone().schedule_work(Box::new(move || {
        Thread::run_sync(&vm, func, vec![arg]);
    }));
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if self.thread.lock().is_some() {
            warn!("event loop dropped without stop()");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cown::CownPtr;
    use crate::vm::Vm;
    use vbci_bytecode::{BytecodeBuilder, Op, TypeId, ValueType};

    #[test]
    fn timer_callbacks_reenter_the_vm() {
        let mut b = BytecodeBuilder::new();
        let main = b.declare_function(&[], TypeId::prim(ValueType::I32), 1);
        b.label(main);
        b.const_i32(0, 0);
        b.op(Op::Return).u(0);

        // cb(c) stores 7 through a reference to its cown argument.
        let cb = b.declare_function(&[TypeId::DYN], TypeId::prim(ValueType::I32), 4);
        b.label(cb);
        b.op(Op::FieldRefCopy).u(1).u(0).u(0);
        b.const_i32(2, 7);
        b.op(Op::StoreCopy).u(3).u(1).u(2);
        b.const_i32(3, 0);
        b.op(Op::Return).u(3);

        let program =
            crate::loader::parse(std::path::Path::new("<unit>"), &b.finish()).unwrap();
        let vm = Vm::with_program(program);

        let cown =
            CownPtr::create(TypeId::prim(ValueType::I32), vm.program.clone()).unwrap();
        cown.inc(); // the handle's argument reference
        let handle = Arc::new(AsyncHandle::new(
            cb,
            Value::Cown {
                cown,
                readonly: false,
            },
        ));

        vm.scheduler.add_external_event_source();
        vm.io.start_timer(
            vm.clone(),
            handle.clone(),
            Duration::from_millis(10),
            Duration::ZERO,
        );

        // Poll until the callback has run.
        let mut stored = false;
        for _ in 0..200 {
            std::thread::sleep(Duration::from_millis(10));
            let mut v = cown.load();
            let hit = matches!(v, Value::I32(7));
            v.drop_reg(&vm.program);
            if hit {
                stored = true;
                break;
            }
        }
        assert!(stored, "timer callback never stored into the cown");

        vm.scheduler.remove_external_event_source();
        handle.arg.lock().drop_reg(&vm.program);
        vm.io.close(&handle);
        vm.scheduler.wait_idle();
        cown.dec(&vm.program);
        vm.io.stop();
    }
}
