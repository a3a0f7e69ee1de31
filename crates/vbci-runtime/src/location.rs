// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The ownership lattice. A location is a tagged `usize`: region pointers
//! are 8-aligned so their low three bits are free for the special
//! singletons. Frame-local allocations carry their region's pointer like
//! any other region member; the region itself records the owning frame.

use std::fmt;

use crate::header::SccPtr;
use crate::region::RegionPtr;

const TAG_MASK: usize = 0x7;
const TAG_REGION: usize = 0x0;
const TAG_STACK: usize = 0x1;
const TAG_IMMUTABLE: usize = 0x2;
const TAG_PENDING: usize = 0x3;
const TAG_IMMORTAL: usize = 0x4;

/// Spacing between consecutive stack frame indices in the encoding.
pub const FRAME_INC: usize = 0x8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location(usize);

impl Location {
    /// The immutable singleton with no SCC block attached (cowns, and the
    /// generic answer for "is immutable" comparisons).
    pub const IMMUTABLE: Location = Location(TAG_IMMUTABLE);
    pub const IMMORTAL: Location = Location(TAG_IMMORTAL);

    pub fn stack(frame_index: usize) -> Location {
        Location(TAG_STACK | (frame_index * FRAME_INC))
    }

    pub fn region(r: RegionPtr) -> Location {
        let raw = r.as_usize();
        debug_assert_eq!(raw & TAG_MASK, 0);
        Location(raw)
    }

    pub fn scc(block: SccPtr) -> Location {
        let raw = block.as_usize();
        debug_assert_eq!(raw & TAG_MASK, 0);
        Location(raw | TAG_IMMUTABLE)
    }

    pub fn from_raw(raw: usize) -> Location {
        Location(raw)
    }

    pub fn raw(self) -> usize {
        self.0
    }

    pub fn is_region(self) -> bool {
        self.0 & TAG_MASK == TAG_REGION && self.0 != 0
    }

    pub fn is_stack(self) -> bool {
        self.0 & TAG_MASK == TAG_STACK
    }

    pub fn is_immutable(self) -> bool {
        self.0 & TAG_MASK == TAG_IMMUTABLE
    }

    pub fn is_pending(self) -> bool {
        self.0 & TAG_MASK == TAG_PENDING
    }

    pub fn is_immortal(self) -> bool {
        self.0 == TAG_IMMORTAL
    }

    /// Locations that never participate in reference counting.
    pub fn no_rc(self) -> bool {
        self.is_stack() || self.is_immortal()
    }

    pub fn as_region(self) -> Option<RegionPtr> {
        if self.is_region() {
            RegionPtr::from_usize(self.0)
        } else {
            None
        }
    }

    pub fn as_scc(self) -> Option<SccPtr> {
        if self.is_immutable() && self.0 != TAG_IMMUTABLE {
            SccPtr::from_usize(self.0 & !TAG_MASK)
        } else {
            None
        }
    }

    pub fn stack_index(self) -> usize {
        debug_assert!(self.is_stack());
        (self.0 & !TAG_MASK) / FRAME_INC
    }

    /// Mark a region location as mid-freeze.
    pub fn pending(self) -> Location {
        debug_assert!(self.is_region());
        Location(self.0 | TAG_PENDING)
    }

    pub fn unpending(self) -> Location {
        debug_assert!(self.is_pending());
        Location(self.0 & !TAG_MASK)
    }

    /// The region, looking through a freeze-time pending mark.
    pub fn region_even_pending(self) -> Option<RegionPtr> {
        if self.is_pending() {
            self.unpending().as_region()
        } else {
            self.as_region()
        }
    }

    /// The frame index this location is pinned to, if any: a stack
    /// allocation's own frame, or the owning frame of a frame-local region.
    pub fn frame_index(self) -> Option<usize> {
        if self.is_stack() {
            return Some(self.stack_index());
        }
        self.as_region().and_then(|r| unsafe { r.get().frame_local() })
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_immortal() {
            write!(f, "immortal")
        } else if self.is_immutable() {
            write!(f, "immutable")
        } else if self.is_stack() {
            write!(f, "stack[{}]", self.stack_index())
        } else if self.is_pending() {
            write!(f, "pending")
        } else {
            write!(f, "region@{:#x}", self.0)
        }
    }
}
