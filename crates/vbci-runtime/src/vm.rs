// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The VM handle: one loaded program, one scheduler, one event loop.
//! Everything the original kept in process-global singletons hangs off
//! this instead; interpreter state stays thread-local.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::LoadError;
use crate::io::EventLoop;
use crate::program::Program;
use crate::thread::Thread;
use crate::value::Value;
use vbci_scheduler::Scheduler;

pub struct Vm {
    pub program: Arc<Program>,
    pub scheduler: Arc<Scheduler>,
    pub io: EventLoop,
}

impl Vm {
    /// Load a bytecode file and bring up the runtime around it.
    pub fn load(path: &Path) -> Result<Arc<Vm>, LoadError> {
        let program = crate::loader::load_file(path)?;
        Ok(Vm::with_program(program))
    }

    pub fn with_program(program: Program) -> Arc<Vm> {
        let vm = Arc::new(Vm {
            program: Arc::new(program),
            scheduler: Arc::new(Scheduler::with_default_threads()),
            io: EventLoop::start(),
        });
        crate::builtins::install(&vm);
        vm
    }

    /// Run `main`, drain every behaviour and pending IO, and return the
    /// process exit code: the program's i32 result, or -1.
    pub fn run(self: &Arc<Vm>) -> i32 {
        let mut ret = Thread::run_main(self);
        self.scheduler.wait_idle();
        self.io.stop();

        let code = match &ret {
            Value::I32(code) => *code,
            Value::Error(info) => {
                error!("{}", self.program.render_error(info));
                -1
            }
            other => {
                error!("`main` must return an i32, got {other}");
                -1
            }
        };
        ret.drop_reg(&self.program);
        debug!(code, "program finished");
        code
    }
}
