//! The tagged value word.
//!
//! A value is one machine word.  The low bit discriminates: low bit `1` means
//! the word holds a **small integer** whose payload is the arithmetic right
//! shift by one (so small ints span `WORDSIZE - 1` signed bits and have no
//! heap presence); low bit `0` means the word is a pointer to an object
//! header.

use std::fmt;

use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

/// A small integer: the unboxed integer payload of a tagged value word.
pub type SmallInt = isize;

/// The smallest representable small integer.
pub const SMALLINT_MIN: SmallInt = isize::MIN >> 1;
/// The largest representable small integer.
pub const SMALLINT_MAX: SmallInt = isize::MAX >> 1;

/// One tagged machine word: either a small integer or an object reference.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Value(usize);

// A value must be exactly one pointer word: slots, registers and meta words
// all store values verbatim.
assert_eq_size!(Value, usize);

impl Value {
    /// Small integer zero.  Also the fill value for freshly entered stack
    /// frames and the conventional "absent" sentinel in object slots.
    pub const SMALLINT_ZERO: Value = Value::smallint(0);

    /// Is the low tag bit set?
    pub const fn is_smallint(self) -> bool {
        self.0 & 1 != 0
    }

    /// Encode a small integer.  The payload silently wraps if `v` is outside
    /// the `WORDSIZE - 1`-bit range; use [`Value::try_smallint`] when the
    /// input is not known to fit.
    pub const fn smallint(v: SmallInt) -> Value {
        Value((v << 1) as usize | 1)
    }

    /// Encode a small integer, or `None` if it does not fit.
    pub fn try_smallint(v: SmallInt) -> Option<Value> {
        let encoded = Value::smallint(v);
        if encoded.as_smallint() == v {
            Some(encoded)
        } else {
            None
        }
    }

    /// Decode the small integer payload (arithmetic right shift by one).
    pub const fn as_smallint(self) -> SmallInt {
        debug_assert!(self.is_smallint());
        (self.0 as isize) >> 1
    }

    /// Wrap an object reference.
    pub fn from_obj(obj: ObjRef) -> Value {
        Value(obj.addr().as_usize())
    }

    /// Unwrap the object reference.  The value must not be a small integer.
    pub fn as_obj(self) -> ObjRef {
        debug_assert!(!self.is_smallint());
        ObjRef(unsafe { Address::from_usize(self.0) })
    }

    /// The raw word.
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Rebuild a value from a raw word.
    ///
    /// # Safety
    /// `raw` must be a word previously obtained from [`Value::raw`], or an
    /// otherwise valid tagged word.
    pub const unsafe fn from_raw(raw: usize) -> Value {
        Value(raw)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_smallint() {
            write!(f, "smallint({})", self.as_smallint())
        } else {
            write!(f, "obj({:#x})", self.0)
        }
    }
}

/// A reference to an object header.  Unlike [`Value`], an `ObjRef` is known
/// not to be a small integer.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ObjRef(Address);

impl ObjRef {
    /// The address of the object header.
    pub fn addr(self) -> Address {
        self.0
    }

    /// Make an object reference from the address of an object header.
    ///
    /// # Safety
    /// `addr` must point at a valid object header (word-aligned, low bit 0).
    pub unsafe fn from_addr(addr: Address) -> ObjRef {
        debug_assert!(addr.is_aligned_to(BYTES_IN_WORD));
        ObjRef(addr)
    }

    /// View this object as a `#[repr(C)]` overlay struct.
    ///
    /// # Safety
    /// The object's type must match the layout of `T` (header, then slots,
    /// then bytes), and the returned reference must not outlive the next
    /// garbage collection.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn deref<T>(self) -> &'static mut T {
        self.0.as_mut_ref()
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjRef({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallint_round_trip() {
        for v in [
            0isize,
            1,
            -1,
            42,
            -42,
            SMALLINT_MAX,
            SMALLINT_MIN,
            SMALLINT_MAX - 1,
            SMALLINT_MIN + 1,
        ] {
            let val = Value::smallint(v);
            assert!(val.is_smallint());
            assert_eq!(val.as_smallint(), v);
        }
    }

    #[test]
    fn smallint_overflow_detected() {
        assert!(Value::try_smallint(SMALLINT_MAX).is_some());
        assert!(Value::try_smallint(SMALLINT_MAX + 1).is_none());
        assert!(Value::try_smallint(SMALLINT_MIN).is_some());
        assert!(Value::try_smallint(SMALLINT_MIN - 1).is_none());
    }

    #[test]
    fn object_refs_are_untagged() {
        let word: usize = 0;
        let addr = Address::from_ref(&word);
        let obj = unsafe { ObjRef::from_addr(addr) };
        let val = Value::from_obj(obj);
        assert!(!val.is_smallint());
        assert_eq!(val.as_obj(), obj);
    }
}
