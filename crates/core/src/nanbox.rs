//! Alternate NaN-boxed `Value` representation (spec.md §3, §9 open question
//! two: "representation can be tagged union (simpler) or NaN-boxed value
//! (faster); implementation should pick one and document the choice").
//!
//! This module documents the layout a `nanbox` backend would use and is
//! compiled only under the `nanbox` feature, which is off by default (see
//! `DESIGN.md`: the tagged union in `value.rs` is the representation this
//! crate actually ships). It is kept here, behind the feature gate, rather
//! than deleted, the way `seq-compiler`'s own `nanbox` Cargo feature
//! documents an alternate codegen backend without wiring it all the way
//! through.
//!
//! # Layout
//!
//! An `f64` has one sign bit, 11 exponent bits, and 52 mantissa bits. Every
//! NaN has all 11 exponent bits set; IEEE leaves the mantissa of a NaN
//! otherwise unconstrained, so a "quiet NaN" with a distinguishing payload
//! in the low 48 bits does not collide with any real number. `NanBoxed`
//! reuses that space:
//!
//! - A plain `f64` number is stored as its own bits, unmodified.
//! - `nil`, `true`, and `false` are each one specific quiet-NaN bit pattern.
//! - A pointer (`ObjRef`, always 8-byte aligned, so its low 3 bits are free)
//!   is stored in the low 48 bits of a quiet NaN with the sign bit set,
//!   matching the "NaN-boxed pointer" scheme used by LuaJIT and clox's
//!   optional `NAN_BOXING` build.
//!
//! This halves `Value`'s size relative to the tagged union (8 bytes instead
//! of 16) at the cost of every accessor needing to test and mask bit
//! patterns instead of matching an enum discriminant.

const QNAN: u64 = 0x7ffc_0000_0000_0000;
const SIGN_BIT: u64 = 0x8000_0000_0000_0000;

const TAG_NIL: u64 = 1;
const TAG_FALSE: u64 = 2;
const TAG_TRUE: u64 = 3;

/// A NaN-boxed value: always exactly 8 bytes, unlike the 16-byte tagged
/// union in `value.rs`. Not implemented beyond this documented layout and
/// the four primitive predicates below; there is no GC or VM code path
/// that constructs one, since the `nanbox` feature carries no default
/// consumers. A future change wiring this in for real would add `from_obj`/
/// `as_obj` following the pointer-masking scheme described above, and would
/// need every `ObjRef` to be provably 8-byte aligned (true today, since
/// `Obj` is allocated via `Box` and never packed).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NanBoxed(u64);

impl NanBoxed {
    #[inline]
    pub fn nil() -> Self {
        NanBoxed(QNAN | TAG_NIL)
    }

    #[inline]
    pub fn bool(b: bool) -> Self {
        NanBoxed(QNAN | if b { TAG_TRUE } else { TAG_FALSE })
    }

    #[inline]
    pub fn number(n: f64) -> Self {
        NanBoxed(n.to_bits())
    }

    #[inline]
    pub fn is_number(self) -> bool {
        (self.0 & QNAN) != QNAN
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == (QNAN | TAG_NIL)
    }

    #[inline]
    pub fn is_obj(self) -> bool {
        (self.0 & (QNAN | SIGN_BIT)) == (QNAN | SIGN_BIT)
    }

    #[inline]
    pub fn as_number(self) -> Option<f64> {
        self.is_number().then(|| f64::from_bits(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_round_trips_through_bit_pattern() {
        let v = NanBoxed::number(3.5);
        assert_eq!(v.as_number(), Some(3.5));
        assert!(!v.is_nil());
        assert!(!v.is_obj());
    }

    #[test]
    fn nil_and_bools_are_distinct_quiet_nans() {
        assert_ne!(NanBoxed::nil(), NanBoxed::bool(true));
        assert_ne!(NanBoxed::bool(true), NanBoxed::bool(false));
        assert!(NanBoxed::nil().is_nil());
        assert!(!NanBoxed::nil().is_number());
    }
}
