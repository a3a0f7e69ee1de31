// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One interpreter call frame: a window into the shared register vector, a
//! finalizer window, the frame-local region, and the non-local-return
//! discipline recorded at the call site.

use vbci_bytecode::CallType;

use crate::location::Location;
use crate::region::RegionPtr;
use crate::stack::StackIdx;

pub struct Frame {
    pub func: u32,
    /// Stack-tagged location of this frame; allocations made with `Stack`
    /// opcodes carry it.
    pub frame_id: Location,
    pub index: usize,
    pub save: StackIdx,
    /// First register of this frame in the shared register vector. The
    /// argument window begins at `base + registers` and doubles as the
    /// callee's register window.
    pub base: usize,
    pub registers: usize,
    pub finalize_base: usize,
    pub finalize_top: usize,
    pub region: RegionPtr,
    pub pc: usize,
    pub dst: u64,
    pub calltype: CallType,
}

impl Frame {
    pub fn local_index(&self, i: u64) -> usize {
        self.base + i as usize
    }

    pub fn arg_index(&self, i: usize) -> usize {
        self.base + self.registers + i
    }
}
