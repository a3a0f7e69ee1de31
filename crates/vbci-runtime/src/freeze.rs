// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Freezing: convert a mutable region graph into immutable,
//! atomically-refcounted SCC blocks that may be shared across threads.
//!
//! The walk is an iterative Tarjan over the reachable object graph.
//! Headers are marked `Pending` while on the Tarjan stack; each discovered
//! SCC becomes one block whose count starts at the number of edges
//! entering it from other SCCs, plus one for the root's register handle.
//! Regions emptied by the freeze are freed.

use std::collections::{HashMap, HashSet};

use crate::array::ArrPtr;
use crate::error::ErrorKind;
use crate::header::{HeaderPtr, SccPtr};
use crate::location::Location;
use crate::object::ObjPtr;
use crate::program::Program;
use crate::region::RegionPtr;
use crate::value::Value;

/// Freeze everything reachable from `v`. Freezing an already-immutable or
/// non-heap value is a no-op. A region with outstanding borrows (stack RC
/// above the single register handle), a parent, a captured owner, or
/// frame-local ownership cannot be frozen.
pub fn freeze(v: &Value, prog: &Program) -> Result<(), ErrorKind> {
    let Some(root) = v.header() else {
        return Ok(());
    };
    let loc = root.location();
    if loc.is_immutable() || loc.is_immortal() {
        return Ok(());
    }
    let Some(region) = loc.as_region() else {
        // Stack allocations cannot be frozen.
        return Err(ErrorKind::BadStore);
    };
    unsafe {
        let r = region.get();
        if r.frame_local().is_some()
            || r.parent().is_some()
            || r.captured()
            || r.readonly()
            || r.stack_rc() > 1
        {
            return Err(ErrorKind::BadStore);
        }
    }

    Freezer::new(prog).run(root)
}

struct Freezer<'a> {
    prog: &'a Program,
    index: HashMap<HeaderPtr, usize>,
    lowlink: HashMap<HeaderPtr, usize>,
    on_stack: HashSet<HeaderPtr>,
    tarjan: Vec<HeaderPtr>,
    next_index: usize,
    sccs: Vec<Vec<HeaderPtr>>,
    scc_of: HashMap<HeaderPtr, usize>,
    regions: HashSet<RegionPtr>,
}

impl<'a> Freezer<'a> {
    fn new(prog: &'a Program) -> Freezer<'a> {
        Freezer {
            prog,
            index: HashMap::new(),
            lowlink: HashMap::new(),
            on_stack: HashSet::new(),
            tarjan: Vec::new(),
            next_index: 0,
            sccs: Vec::new(),
            scc_of: HashMap::new(),
            regions: HashSet::new(),
        }
    }

    fn run(mut self, root: HeaderPtr) -> Result<(), ErrorKind> {
        self.visit(root)?;
        self.commit(root);
        Ok(())
    }

    fn neighbours(&self, h: HeaderPtr) -> Vec<HeaderPtr> {
        let mut out = Vec::new();
        if h.is_array() {
            ArrPtr::from_header(h).trace(&mut out);
        } else {
            ObjPtr::from_header(h).trace(self.prog, &mut out);
        }
        out
    }

    /// Admission check on a node about to enter the walk; returns the
    /// region it belongs to, or `None` for already-immutable neighbours.
    fn admit(&mut self, h: HeaderPtr) -> Result<Option<RegionPtr>, ErrorKind> {
        let loc = h.location();
        if loc.is_immutable() || loc.is_immortal() {
            return Ok(None);
        }
        if loc.is_stack() {
            return Err(ErrorKind::BadStore);
        }
        let region = if loc.is_pending() {
            loc.unpending().as_region()
        } else {
            loc.as_region()
        };
        let Some(region) = region else {
            return Err(ErrorKind::BadStore);
        };
        unsafe {
            let r = region.get();
            if r.frame_local().is_some() || r.captured() {
                return Err(ErrorKind::BadStore);
            }
        }
        Ok(Some(region))
    }

    fn open(&mut self, h: HeaderPtr, region: RegionPtr) {
        self.index.insert(h, self.next_index);
        self.lowlink.insert(h, self.next_index);
        self.next_index += 1;
        self.tarjan.push(h);
        self.on_stack.insert(h);
        self.regions.insert(region);
        h.set_location(Location::region(region).pending());
    }

    /// Iterative Tarjan from `root`.
    fn visit(&mut self, root: HeaderPtr) -> Result<(), ErrorKind> {
        let Some(region) = self.admit(root)? else {
            return Ok(());
        };
        self.open(root, region);
        // (node, its neighbours, next edge to examine)
        let mut stack: Vec<(HeaderPtr, Vec<HeaderPtr>, usize)> = Vec::new();
        let neighbours = self.neighbours(root);
        stack.push((root, neighbours, 0));

        while !stack.is_empty() {
            let last = stack.len() - 1;
            let v = stack[last].0;
            if stack[last].2 < stack[last].1.len() {
                let w = stack[last].1[stack[last].2];
                stack[last].2 += 1;
                if self.index.contains_key(&w) {
                    if self.on_stack.contains(&w) {
                        let low = self.lowlink[&v].min(self.index[&w]);
                        self.lowlink.insert(v, low);
                    }
                    continue;
                }
                let Some(region) = self.admit(w)? else {
                    continue;
                };
                self.open(w, region);
                let next = self.neighbours(w);
                stack.push((w, next, 0));
            } else {
                // v is fully explored; pop an SCC if it is a root.
                if self.lowlink[&v] == self.index[&v] {
                    let mut scc = Vec::new();
                    while let Some(h) = self.tarjan.pop() {
                        self.on_stack.remove(&h);
                        self.scc_of.insert(h, self.sccs.len());
                        let done = h == v;
                        scc.push(h);
                        if done {
                            break;
                        }
                    }
                    self.sccs.push(scc);
                }
                stack.pop();
                if let Some((parent, _, _)) = stack.last() {
                    let low = self.lowlink[parent].min(self.lowlink[&v]);
                    self.lowlink.insert(*parent, low);
                }
            }
        }
        Ok(())
    }

    /// Turn every SCC into a block and free the emptied regions.
    fn commit(mut self, root: HeaderPtr) {
        // Seed each block with its cross-SCC in-degree.
        let mut incoming: Vec<u32> = vec![0; self.sccs.len()];
        for (&h, &scc) in &self.scc_of {
            for n in self.neighbours(h) {
                if let Some(&target) = self.scc_of.get(&n) {
                    if target != scc {
                        incoming[target] += 1;
                    }
                }
            }
        }
        if let Some(&root_scc) = self.scc_of.get(&root) {
            // The register handle that requested the freeze.
            incoming[root_scc] += 1;
        }

        for (i, members) in std::mem::take(&mut self.sccs).into_iter().enumerate() {
            let block = SccPtr::alloc(incoming[i].max(1), members.clone());
            for h in members {
                if let Some(region) = h.location().region_even_pending() {
                    unsafe {
                        region.get().remove(h);
                    }
                }
                h.set_location(Location::scc(block));
                // Per-object counts are meaningless once immutable.
                h.set_rc(0);
            }
        }

        for region in std::mem::take(&mut self.regions) {
            unsafe {
                if region.get().member_count() == 0 {
                    if region.get().parent().is_some() {
                        region.get().clear_parent(self.prog);
                    }
                    region.free_box();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjPtr;
    use crate::region::RegionPtr;
    use vbci_bytecode::{BytecodeBuilder, Op, RegionType, TypeId, ValueType};

    fn test_program() -> Program {
        let mut b = BytecodeBuilder::new();
        let main = b.declare_function(&[], TypeId::prim(ValueType::I32), 1);
        b.label(main);
        b.const_i32(0, 0);
        b.op(Op::Return).u(0);
        b.add_class(&[(0, TypeId::prim(ValueType::I32)), (1, TypeId::DYN)], &[]);
        crate::loader::parse(std::path::Path::new("<unit>"), &b.finish()).unwrap()
    }

    fn make_pair(prog: &Program) -> (RegionPtr, ObjPtr, ObjPtr) {
        let region = RegionPtr::alloc(RegionType::Rc);
        let cls = prog.cls(0).unwrap();
        unsafe {
            let a = region.get().object(cls);
            let b = region.get().object(cls);
            // a -> b, and b -> a: one strongly-connected component. The
            // stores consume register-flavoured handles, as the
            // interpreter's stores do.
            let mut vb = Value::Object(b, false);
            a.store_field(1, true, &mut vb, prog).unwrap();
            let mut va = Value::Object(a, false).copy_reg();
            b.store_field(1, true, &mut va, prog).unwrap();
            // One register handle (a's, held by the caller) remains.
            (region, a, b)
        }
    }

    #[test]
    fn freezing_a_cycle_builds_one_scc() {
        let prog = test_program();
        let (region, a, b) = make_pair(&prog);
        let _ = region;
        let v = Value::Object(a, false);
        freeze(&v, &prog).unwrap();

        assert!(a.header().location().is_immutable());
        assert!(b.header().location().is_immutable());
        let scc_a = a.header().location().as_scc().unwrap();
        let scc_b = b.header().location().as_scc().unwrap();
        assert_eq!(scc_a, scc_b);
        // The register handle keeps the block alive.
        assert_eq!(scc_a.rc(), 1);

        let mut v = v;
        v.drop_reg(&prog);
    }

    #[test]
    fn freezing_immutable_or_scalar_values_is_a_noop() {
        let prog = test_program();
        assert!(freeze(&Value::I32(3), &prog).is_ok());

        let (region, a, _b) = make_pair(&prog);
        let _ = region;
        let v = Value::Object(a, false);
        freeze(&v, &prog).unwrap();
        // Idempotent: a second freeze leaves the block untouched.
        freeze(&v, &prog).unwrap();
        let scc = a.header().location().as_scc().unwrap();
        assert_eq!(scc.rc(), 1);
        let mut v = v;
        v.drop_reg(&prog);
    }

    #[test]
    fn outstanding_borrows_reject_the_freeze() {
        let prog = test_program();
        let (region, a, _b) = make_pair(&prog);
        let v = Value::Object(a, false);
        // A second register handle: the region is not sendable.
        let mut borrow = v.copy_reg();
        assert_eq!(freeze(&v, &prog).unwrap_err(), ErrorKind::BadStore);
        borrow.drop_reg(&prog);
        let _ = region;
        let mut v = v;
        v.drop_reg(&prog);
    }
}
