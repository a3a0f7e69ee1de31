// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::value_type::ValueType;

const REF_FLAG: u32 = 1 << 31;
const MOD_SHIFT: u32 = 29;
const MOD_MASK: u32 = 0b11 << MOD_SHIFT;
const MOD_ARRAY: u32 = 1 << MOD_SHIFT;
const MOD_COWN: u32 = 2 << MOD_SHIFT;
const BASE_MASK: u32 = (1 << MOD_SHIFT) - 1;

const DYN_BASE: u32 = 17;
const FIRST_CLASS: u32 = 18;

/// A reified type identifier.
///
/// The low 29 bits name a base type (a primitive, `dyn`, or a user class);
/// bits 29–30 apply an `array` or `cown` modifier and bit 31 a `ref`
/// modifier. One level of each modifier is representable; deeper nesting
/// saturates to the `dyn` base.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    /// The top of the subtype lattice.
    pub const DYN: TypeId = TypeId(DYN_BASE);

    pub const fn from_raw(raw: u32) -> TypeId {
        TypeId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn prim(t: ValueType) -> TypeId {
        debug_assert!(t.is_primitive());
        TypeId(t as u32)
    }

    pub fn class(index: u32) -> TypeId {
        TypeId(FIRST_CLASS + index)
    }

    pub fn array_of(self) -> TypeId {
        if self.0 & (MOD_MASK | REF_FLAG) != 0 {
            // One modifier level only; deeper element types erase to dyn.
            TypeId(DYN_BASE | MOD_ARRAY)
        } else {
            TypeId(self.0 | MOD_ARRAY)
        }
    }

    pub fn cown_of(self) -> TypeId {
        if self.0 & (MOD_MASK | REF_FLAG) != 0 {
            TypeId(DYN_BASE | MOD_COWN)
        } else {
            TypeId(self.0 | MOD_COWN)
        }
    }

    pub fn ref_of(self) -> TypeId {
        if self.0 & REF_FLAG != 0 {
            TypeId(DYN_BASE | REF_FLAG)
        } else {
            TypeId(self.0 | REF_FLAG)
        }
    }

    pub fn is_dyn(self) -> bool {
        self.0 == DYN_BASE
    }

    pub fn is_ref(self) -> bool {
        self.0 & REF_FLAG != 0
    }

    pub fn is_array(self) -> bool {
        (self.0 & REF_FLAG == 0) && (self.0 & MOD_MASK == MOD_ARRAY)
    }

    pub fn is_cown(self) -> bool {
        (self.0 & REF_FLAG == 0) && (self.0 & MOD_MASK == MOD_COWN)
    }

    /// Strip the outermost modifier, yielding the content type.
    pub fn unmod(self) -> TypeId {
        if self.0 & REF_FLAG != 0 {
            TypeId(self.0 & !REF_FLAG)
        } else {
            TypeId(self.0 & !MOD_MASK)
        }
    }

    /// The primitive this id names, if it is an unmodified primitive.
    pub fn as_primitive(self) -> Option<ValueType> {
        if self.0 < NUM_PRIM {
            ValueType::try_from(self.0 as u8).ok()
        } else {
            None
        }
    }

    /// The class index this id names, if it is an unmodified class.
    pub fn as_class(self) -> Option<u32> {
        if self.0 & (MOD_MASK | REF_FLAG) == 0 && self.0 >= FIRST_CLASS {
            Some(self.0 - FIRST_CLASS)
        } else {
            None
        }
    }

    /// Answers "is `self` a subtype of `other`". The lattice is identity
    /// plus `dyn` as top; composite ids are invariant in their content.
    pub fn subtype_of(self, other: TypeId) -> bool {
        self == other || other.is_dyn()
    }
}

const NUM_PRIM: u32 = crate::value_type::NUM_PRIMITIVE_CLASSES as u32;

impl std::fmt::Debug for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ref() {
            return write!(f, "ref {:?}", self.unmod());
        }
        if self.is_array() {
            return write!(f, "array {:?}", self.unmod());
        }
        if self.is_cown() {
            return write!(f, "cown {:?}", self.unmod());
        }
        match (self.as_primitive(), self.as_class()) {
            (Some(p), _) => write!(f, "{p:?}"),
            (_, Some(c)) => write!(f, "class#{c}"),
            _ => write!(f, "dyn"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifiers_round_trip() {
        let i32_id = TypeId::prim(ValueType::I32);
        assert!(i32_id.array_of().is_array());
        assert_eq!(i32_id.array_of().unmod(), i32_id);
        assert_eq!(i32_id.cown_of().unmod(), i32_id);
        assert_eq!(i32_id.ref_of().unmod(), i32_id);
        assert!(TypeId::class(3).as_class() == Some(3));
    }

    #[test]
    fn nested_modifiers_saturate_to_dyn() {
        let arr = TypeId::prim(ValueType::U8).array_of();
        assert_eq!(arr.array_of().unmod(), TypeId::DYN);
        // A ref can wrap an array without losing it.
        assert!(arr.ref_of().is_ref());
        assert_eq!(arr.ref_of().unmod(), arr);
    }

    #[test]
    fn subtyping_is_identity_plus_dyn() {
        let a = TypeId::class(0);
        let b = TypeId::class(1);
        assert!(a.subtype_of(a));
        assert!(!a.subtype_of(b));
        assert!(a.subtype_of(TypeId::DYN));
        assert!(a.array_of().subtype_of(TypeId::DYN));
        assert!(!a.array_of().subtype_of(b.array_of()));
    }
}
