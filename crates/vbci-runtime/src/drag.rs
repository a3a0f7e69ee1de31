// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Relocation of frame-local subgraphs. When a frame-local allocation
//! escapes through a return, everything reachable from it must move into
//! the caller's frame-local region (or a fresh region for the outermost
//! frame) without breaking the location invariants.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::array::ArrPtr;
use crate::header::HeaderPtr;
use crate::object::ObjPtr;
use crate::program::Program;
use crate::region::RegionPtr;

/// Drag everything reachable from `h` into `dest`. Returns false when the
/// relocation would violate an invariant; the graph is untouched in that
/// case.
pub fn drag_allocation(dest: RegionPtr, h: HeaderPtr, prog: &Program) -> bool {
    let dest_frame = unsafe { dest.get().frame_local() };

    let mut wl: Vec<HeaderPtr> = vec![h];
    // Internal reference counts per dragged header; the root's first entry
    // is the worklist seed, not an edge.
    let mut rc_map: HashMap<HeaderPtr, u32> = HashMap::new();
    // Regions entered from the dragged graph (real-region destinations
    // adopt them as children).
    let mut entered: HashSet<RegionPtr> = HashSet::new();
    // Borrows of the destination itself that become internal edges.
    let mut dest_borrows: u32 = 0;

    while let Some(next) = wl.pop() {
        if let Some(count) = rc_map.get_mut(&next) {
            *count += 1;
            continue;
        }

        let loc = next.location();
        if loc.is_immutable() || loc.is_immortal() {
            continue;
        }
        // No region, not even a frame-local one, may point to the stack.
        if loc.is_stack() {
            return false;
        }

        let Some(region) = loc.as_region() else {
            return false;
        };
        let region_frame = unsafe { region.get().frame_local() };

        if let Some(member_frame) = region_frame {
            // Members of an older frame's region (the destination's own
            // members included) are external ancestors when the
            // destination is frame-local itself.
            if let Some(df) = dest_frame {
                if df >= member_frame {
                    continue;
                }
            }
            rc_map.insert(next, 1);
            if next.is_array() {
                ArrPtr::from_header(next).trace(&mut wl);
            } else {
                ObjPtr::from_header(next).trace(prog, &mut wl);
            }
            continue;
        }

        // A real-region neighbour. Frame-local destinations leave it
        // where it is; real destinations adopt the whole region.
        if dest_frame.is_none() {
            if region == dest {
                dest_borrows += 1;
                continue;
            }
            unsafe {
                let r = region.get();
                if r.parent().is_some() || r.captured() {
                    return false;
                }
                if r.is_ancestor_of(dest) {
                    return false;
                }
            }
            // A single entry point per region keeps the forest shape.
            if !entered.insert(region) {
                return false;
            }
        }
    }

    // Commit: adopt entered regions, then move the dragged headers.
    if dest_frame.is_none() {
        for region in &entered {
            unsafe {
                region.get().set_parent(dest);
                region.get().stack_dec(prog);
            }
        }
    }

    for (&hh, &count) in &rc_map {
        let internal = if hh == h { count - 1 } else { count };
        let total = hh.rc();
        debug_assert!(total >= internal);
        trace!(header = ?hh, internal, total, "dragging header");
        unsafe {
            if let Some(old) = hh.location().as_region() {
                old.get().remove(hh);
            }
            dest.get().insert(hh);
            dest.get().stack_inc_n(total - internal);
        }
        hh.set_location(dest.location());
    }

    unsafe {
        for _ in 0..dest_borrows {
            dest.get().stack_dec(prog);
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionPtr;
    use crate::value::Value;
    use vbci_bytecode::{BytecodeBuilder, Op, RegionType, TypeId, ValueType};

    fn test_program() -> crate::program::Program {
        let mut b = BytecodeBuilder::new();
        let main = b.declare_function(&[], TypeId::prim(ValueType::I32), 1);
        b.label(main);
        b.const_i32(0, 0);
        b.op(Op::Return).u(0);
        b.add_class(&[(0, TypeId::prim(ValueType::I32)), (1, TypeId::DYN)], &[]);
        crate::loader::parse(std::path::Path::new("<unit>"), &b.finish()).unwrap()
    }

    #[test]
    fn drags_a_chain_into_an_older_frame() {
        let prog = test_program();
        let cls = prog.cls(0).unwrap();
        let older = RegionPtr::alloc_frame_local(0);
        let younger = RegionPtr::alloc_frame_local(1);
        unsafe {
            older.get().stack_inc();
            younger.get().stack_inc();

            // root -> inner, both in the younger frame's region.
            let root = younger.get().object(cls);
            let inner = younger.get().object(cls);
            let mut v = Value::Object(inner, false);
            root.store_field(1, true, &mut v, &prog).unwrap();

            let before = older.get().stack_rc();
            assert!(drag_allocation(older, root.header(), &prog));

            assert_eq!(younger.get().member_count(), 0);
            assert_eq!(older.get().member_count(), 2);
            assert_eq!(root.header().location(), older.location());
            assert_eq!(inner.header().location(), older.location());
            // The root's register handle moved its unit to the
            // destination; the internal edge did not.
            assert_eq!(older.get().stack_rc(), before + 1);
        }
    }

    #[test]
    fn stack_neighbours_fail_the_drag() {
        let prog = test_program();
        let cls = prog.cls(0).unwrap();
        let dest = RegionPtr::alloc_frame_local(0);
        let src = RegionPtr::alloc_frame_local(1);
        unsafe {
            dest.get().stack_inc();
            src.get().stack_inc();

            let root = src.get().object(cls);
            // Hand-wire a stack-located allocation into the graph.
            let mut stack = crate::stack::Stack::new();
            let mem = stack.alloc(cls.size).unwrap();
            let escapee = ObjPtr::init_at(mem, cls, crate::location::Location::stack(1));
            let mut v = Value::Object(escapee, false);
            // A frame-local target admits stack values of its own frame.
            root.store_field(1, true, &mut v, &prog).unwrap();

            assert!(!drag_allocation(dest, root.header(), &prog));
        }
    }

    #[test]
    fn real_region_destination_adopts_entered_regions() {
        let prog = test_program();
        let cls = prog.cls(0).unwrap();
        let dest = RegionPtr::alloc(RegionType::Rc);
        let frame = RegionPtr::alloc_frame_local(0);
        let other = RegionPtr::alloc(RegionType::Rc);
        unsafe {
            dest.get().stack_inc();
            frame.get().stack_inc();

            let root = frame.get().object(cls);
            let entry = other.get().object(cls);
            let mut v = Value::Object(entry, false);
            root.store_field(1, true, &mut v, &prog).unwrap();
            assert_eq!(other.get().stack_rc(), 1);

            assert!(drag_allocation(dest, root.header(), &prog));
            assert_eq!(other.get().parent(), Some(dest));
            assert_eq!(dest.get().member_count(), 1);
        }
    }
}
