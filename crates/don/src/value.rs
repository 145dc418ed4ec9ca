//! Value references and type tags.
//!
//! Every runtime value is addressed through a [`VRef`]: either an integer
//! encoded inline in the handle itself, or a byte offset into the heap
//! arena. The inline encoding is confined to this module; everything else
//! goes through [`VRef::from_int`] and [`VRef::as_int`].

use strum::{FromRepr, IntoStaticStr};

/// Bit marking a `VRef` as an inline integer rather than an arena offset.
const INT_MARK: u32 = 1 << 31;

/// Width of the inline integer payload in bits.
const INT_BITS: u32 = 31;

/// Smallest integer representable inline.
pub const INT_MIN: i32 = -(1 << (INT_BITS - 1));

/// Largest integer representable inline.
pub const INT_MAX: i32 = (1 << (INT_BITS - 1)) - 1;

/// Sign-extends the low `bits` bits of `payload` to a full `i32`.
#[inline]
fn sign_extend(payload: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((payload << shift) as i32) >> shift
}

/// An opaque handle to a runtime value.
///
/// `VRef(0)` is the null reference. A handle with the top bit set carries
/// a 31-bit signed integer inline; any other handle is a byte offset into
/// the heap arena, pointing at an object prolog.
///
/// NOTE: handles compare by identity. Use `Heap::equals` for structural
/// equality; two distinct refs may denote equal strings or lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VRef(u32);

impl VRef {
    /// The null reference.
    pub const NULL: Self = Self(0);

    /// Encodes an integer inline.
    ///
    /// # Panics
    /// Panics if `value` does not fit the 31-bit inline payload.
    #[inline]
    #[must_use]
    pub fn from_int(value: i32) -> Self {
        assert!(
            (INT_MIN..=INT_MAX).contains(&value),
            "integer {value} out of inline range"
        );
        Self((value as u32 & !INT_MARK) | INT_MARK)
    }

    /// Decodes the inline integer, or `None` for arena references.
    #[inline]
    #[must_use]
    pub fn as_int(self) -> Option<i32> {
        if self.0 & INT_MARK != 0 {
            Some(sign_extend(self.0 & !INT_MARK, INT_BITS))
        } else {
            None
        }
    }

    /// Returns true when the handle carries an inline integer.
    #[inline]
    #[must_use]
    pub fn is_int(self) -> bool {
        self.0 & INT_MARK != 0
    }

    /// Returns true for the null reference.
    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Builds a handle from an arena byte offset.
    #[inline]
    pub(crate) fn from_offset(offset: usize) -> Self {
        let offset = u32::try_from(offset).expect("heap offset exceeds handle range");
        debug_assert_eq!(offset & INT_MARK, 0, "heap exceeded the addressable range");
        Self(offset)
    }

    /// Returns the arena byte offset of a non-integer, non-null handle.
    #[inline]
    pub(crate) fn offset(self) -> usize {
        debug_assert!(!self.is_int() && !self.is_null());
        self.0 as usize
    }

    /// Raw bits, for storage in heap payload words.
    #[inline]
    pub(crate) fn to_bits(self) -> u32 {
        self.0
    }

    /// Inverse of [`VRef::to_bits`].
    #[inline]
    pub(crate) fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

/// Runtime type of a heap object.
///
/// The discriminants are observable: [`crate::heap::Heap::hash_into`]
/// emits one tag byte per value, and cache keys depend on those bytes
/// staying put. Strings canonicalise to `String` and collections to
/// `Array` when hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u32)]
pub enum VType {
    Null = 0,
    BooleanTrue = 1,
    BooleanFalse = 2,
    Integer = 3,
    String = 4,
    StringPooled = 5,
    StringWrapped = 6,
    Substring = 7,
    File = 8,
    EmptyList = 9,
    Array = 10,
    IntegerRange = 11,
    ConcatList = 12,
    Future = 13,
}

impl VType {
    /// Returns true for the list-like types.
    #[must_use]
    pub fn is_collection(self) -> bool {
        matches!(self, Self::EmptyList | Self::Array | Self::IntegerRange | Self::ConcatList)
    }

    /// Returns true for the string-like types.
    #[must_use]
    pub fn is_string(self) -> bool {
        matches!(
            self,
            Self::String | Self::StringPooled | Self::StringWrapped | Self::Substring
        )
    }
}

/// Three-valued truthiness: a value backed by an unresolved future is
/// neither true nor false yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    /// Value not yet known.
    Future,
}
