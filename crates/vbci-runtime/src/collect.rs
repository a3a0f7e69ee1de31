// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Re-entrancy-safe teardown. Finalizers and refcount decrements can
//! trigger further decrements; a thread-local worklist flattens the
//! cascade so deallocation runs with bounded stack and in a stable order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::array::ArrPtr;
use crate::header::{HeaderPtr, SccPtr};
use crate::object::ObjPtr;
use crate::program::Program;
use crate::region::RegionPtr;

enum WorkItem {
    Header(HeaderPtr),
    Region(RegionPtr),
    Scc(SccPtr),
}

thread_local! {
    static WORKLIST: RefCell<VecDeque<WorkItem>> = RefCell::new(VecDeque::new());
    static IN_COLLECTION: Cell<bool> = const { Cell::new(false) };
}

pub fn collect_header(h: HeaderPtr, prog: &Program) {
    collect(WorkItem::Header(h), prog);
}

pub fn collect_region(r: RegionPtr, prog: &Program) {
    collect(WorkItem::Region(r), prog);
}

pub fn collect_scc(scc: SccPtr, prog: &Program) {
    collect(WorkItem::Scc(scc), prog);
}

fn collect(item: WorkItem, prog: &Program) {
    WORKLIST.with(|wl| wl.borrow_mut().push_back(item));
    if IN_COLLECTION.with(|f| f.get()) {
        // Someone up the stack is already draining.
        return;
    }

    IN_COLLECTION.with(|f| f.set(true));
    loop {
        let next = WORKLIST.with(|wl| wl.borrow_mut().pop_front());
        let Some(item) = next else { break };
        match item {
            WorkItem::Header(h) => unsafe {
                tracing::trace!(header = ?h, "collect");
                if h.is_array() {
                    let arr = ArrPtr::from_header(h);
                    arr.finalize(prog);
                    if let Some(r) = h.region() {
                        r.get().remove(h);
                    }
                    arr.free_memory();
                } else {
                    let obj = ObjPtr::from_header(h);
                    obj.finalize(prog);
                    if let Some(r) = h.region() {
                        r.get().remove(h);
                    }
                    obj.free_memory(prog);
                }
            },
            WorkItem::Region(r) => {
                tracing::trace!(region = ?r, "collect");
                r.deallocate(prog);
            }
            WorkItem::Scc(scc) => unsafe {
                scc.free(prog);
            },
        }
    }
    IN_COLLECTION.with(|f| f.set(false));
}

#[cfg(test)]
mod tests {
    // The collector is exercised end to end through region teardown in the
    // region and interpreter tests; the worklist itself has no observable
    // state to probe beyond "does not recurse", which the nested-region
    // teardown tests cover.
}
