//! The value heap: a single byte arena holding every runtime value.
//!
//! Objects are stored with an 8-byte prolog (payload size, then type tag)
//! and addressed by byte offset through [`VRef`]. Integers are never
//! stored in the arena; they live inline in the handle. The arena is
//! allocated once per build and released as a whole, so nothing here
//! reclaims memory mid-run.
//!
//! Futures are the one mutable object kind: a future's payload is
//! rewritten in place when it resolves, either directly through
//! [`Heap::set_future`] or lazily when an expression future's operands
//! become concrete during [`Heap::try_wait`].

use sha2::{Digest, Sha512};
use strum::FromRepr;

use crate::{
    files::{FileId, FileTable},
    intern::{Interner, StringId},
    value::{INT_MAX, INT_MIN, Truth, VRef, VType},
};

/// Object prolog: `u32` payload size followed by `u32` type tag.
const OBJECT_OVERHEAD: usize = 8;

/// Future payload states.
const FUTURE_PENDING: u32 = 0;
const FUTURE_RESOLVED: u32 = 1;
const FUTURE_UNARY: u32 = 2;
const FUTURE_BINARY: u32 = 3;

/// Binary operations evaluated by the heap.
///
/// The VM maps arithmetic opcodes onto these, and expression futures
/// store them in their payload, so the discriminants must stay put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum BinaryOp {
    Equals = 0,
    NotEquals = 1,
    LessEquals = 2,
    GreaterEquals = 3,
    Less = 4,
    Greater = 5,
    And = 6,
    Add = 7,
    Sub = 8,
    Mul = 9,
    Div = 10,
    Rem = 11,
    ConcatList = 12,
    ConcatString = 13,
    IndexedAccess = 14,
    Range = 15,
}

/// Unary operations evaluated by the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum UnaryOp {
    Not = 0,
    Neg = 1,
    Inv = 2,
}

/// A failed concrete evaluation (type mismatch, overflow, bad index).
///
/// The VM turns this into a halt carrying the current source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError(pub String);

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

type EvalResult = Result<VRef, EvalError>;

/// Well-known values allocated at heap construction.
///
/// These refs may be handed out freely instead of allocating equal
/// objects; never compare against them for equality tests, use
/// [`Heap::equals`].
#[derive(Debug, Clone, Copy)]
pub struct Singletons {
    pub true_: VRef,
    pub false_: VRef,
    pub empty_string: VRef,
    pub empty_list: VRef,
    pub newline: VRef,
}

/// The arena and everything needed to interpret refs into it.
#[derive(Debug)]
pub struct Heap {
    arena: Vec<u8>,
    singles: Singletons,
    files: FileTable,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Self {
            // Offset 0 must never name an object; VRef(0) is null.
            arena: vec![0; OBJECT_OVERHEAD],
            singles: Singletons {
                true_: VRef::NULL,
                false_: VRef::NULL,
                empty_string: VRef::NULL,
                empty_list: VRef::NULL,
                newline: VRef::NULL,
            },
            files: FileTable::new(),
        };
        heap.singles.true_ = heap.alloc(VType::BooleanTrue, 0);
        heap.singles.false_ = heap.alloc(VType::BooleanFalse, 0);
        heap.singles.empty_string = heap.alloc(VType::String, 0);
        heap.singles.empty_list = heap.alloc(VType::EmptyList, 0);
        heap.singles.newline = {
            let r = heap.alloc(VType::String, 1);
            heap.data_mut(r)[0] = b'\n';
            r
        };
        heap
    }

    #[must_use]
    pub fn singles(&self) -> &Singletons {
        &self.singles
    }

    #[must_use]
    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut FileTable {
        &mut self.files
    }

    /// Converts a boolean into the matching singleton.
    #[must_use]
    pub fn boolean(&self, value: bool) -> VRef {
        if value { self.singles.true_ } else { self.singles.false_ }
    }

    // ------------------------------------------------------------------
    // Raw object access
    // ------------------------------------------------------------------

    /// Reserves a zero-filled object and returns its handle.
    ///
    /// # Panics
    /// Panics with "Out of memory" when the arena would exceed the
    /// addressable handle range.
    pub fn alloc(&mut self, vtype: VType, size: usize) -> VRef {
        let offset = self.arena.len();
        assert!(
            offset + OBJECT_OVERHEAD + size < (1 << 31),
            "Out of memory: heap exhausted"
        );
        let size32 = u32::try_from(size).expect("object size exceeds u32");
        self.arena.extend_from_slice(&size32.to_ne_bytes());
        self.arena.extend_from_slice(&(vtype as u32).to_ne_bytes());
        self.arena.resize(offset + OBJECT_OVERHEAD + size, 0);
        VRef::from_offset(offset)
    }

    /// Returns the runtime type of any value, including inline integers
    /// and the null reference.
    #[must_use]
    pub fn get_type(&self, r: VRef) -> VType {
        if r.is_int() {
            return VType::Integer;
        }
        if r.is_null() {
            return VType::Null;
        }
        let tag = self.read_u32(r.offset() + 4);
        VType::from_repr(tag).expect("corrupt type tag in arena")
    }

    /// Payload size in bytes of an arena object.
    #[must_use]
    pub fn get_size(&self, r: VRef) -> usize {
        self.read_u32(r.offset()) as usize
    }

    /// Payload bytes of an arena object.
    #[must_use]
    pub fn get_data(&self, r: VRef) -> &[u8] {
        let start = r.offset() + OBJECT_OVERHEAD;
        &self.arena[start..start + self.get_size(r)]
    }

    fn data_mut(&mut self, r: VRef) -> &mut [u8] {
        let start = r.offset() + OBJECT_OVERHEAD;
        let size = self.get_size(r);
        &mut self.arena[start..start + size]
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_ne_bytes(self.arena[offset..offset + 4].try_into().expect("sliced to length"))
    }

    fn payload_word(&self, r: VRef, index: usize) -> u32 {
        self.read_u32(r.offset() + OBJECT_OVERHEAD + index * 4)
    }

    fn set_payload_word(&mut self, r: VRef, index: usize, value: u32) {
        let start = r.offset() + OBJECT_OVERHEAD + index * 4;
        self.arena[start..start + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn payload_ref(&self, r: VRef, index: usize) -> VRef {
        VRef::from_bits(self.payload_word(r, index))
    }

    // ------------------------------------------------------------------
    // Integers
    // ------------------------------------------------------------------

    /// Encodes an integer inline in the handle.
    #[must_use]
    pub fn box_integer(value: i32) -> VRef {
        VRef::from_int(value)
    }

    /// Decodes an inline integer.
    ///
    /// # Panics
    /// Calling this on anything but an integer is a programming error.
    #[must_use]
    pub fn unbox_integer(r: VRef) -> i32 {
        r.as_int().expect("value is not an integer")
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Copies bytes into a fresh string object.
    pub fn create_string(&mut self, bytes: &[u8]) -> VRef {
        if bytes.is_empty() {
            return self.singles.empty_string;
        }
        let r = self.alloc(VType::String, bytes.len());
        self.data_mut(r).copy_from_slice(bytes);
        r
    }

    /// Wraps a pooled string without copying it.
    pub fn create_pooled_string(&mut self, id: StringId) -> VRef {
        let r = self.alloc(VType::StringPooled, 4);
        self.set_payload_word(r, 0, id.index());
        r
    }

    /// Wraps a byte range of a pooled string without copying.
    pub fn create_wrapped_string(&mut self, id: StringId, offset: usize, length: usize) -> VRef {
        if length == 0 {
            return self.singles.empty_string;
        }
        let r = self.alloc(VType::StringWrapped, 12);
        self.set_payload_word(r, 0, id.index());
        self.set_payload_word(r, 1, u32::try_from(offset).expect("offset exceeds u32"));
        self.set_payload_word(r, 2, u32::try_from(length).expect("length exceeds u32"));
        r
    }

    /// Creates a view into an existing string. Never copies.
    ///
    /// # Panics
    /// Panics when `parent` is not a string or the range is out of
    /// bounds.
    pub fn create_substring(&mut self, interns: &Interner, parent: VRef, offset: usize, length: usize) -> VRef {
        let parent_type = self.get_type(parent);
        assert!(parent_type.is_string(), "substring of a non-string");
        assert!(
            offset + length <= self.string_length(interns, parent),
            "substring out of bounds"
        );
        if length == 0 {
            return self.singles.empty_string;
        }
        if length == self.string_length(interns, parent) {
            return parent;
        }
        match parent_type {
            VType::String => self.substring_node(parent, offset, length),
            VType::StringPooled => {
                let id = StringId::from_index(self.payload_word(parent, 0));
                self.create_wrapped_string(id, offset, length)
            }
            VType::StringWrapped => {
                let id = StringId::from_index(self.payload_word(parent, 0));
                let base = self.payload_word(parent, 1) as usize;
                self.create_wrapped_string(id, base + offset, length)
            }
            VType::Substring => {
                let base_parent = self.payload_ref(parent, 0);
                let base = self.payload_word(parent, 1) as usize;
                self.substring_node(base_parent, base + offset, length)
            }
            _ => unreachable!("checked string type above"),
        }
    }

    fn substring_node(&mut self, parent: VRef, offset: usize, length: usize) -> VRef {
        let r = self.alloc(VType::Substring, 12);
        self.set_payload_word(r, 0, parent.to_bits());
        self.set_payload_word(r, 1, u32::try_from(offset).expect("offset exceeds u32"));
        self.set_payload_word(r, 2, u32::try_from(length).expect("length exceeds u32"));
        r
    }

    /// Raw bytes of a string value.
    #[must_use]
    pub fn string_bytes<'a>(&'a self, interns: &'a Interner, r: VRef) -> &'a [u8] {
        match self.get_type(r) {
            VType::String => self.get_data(r),
            VType::StringPooled => interns.get(StringId::from_index(self.payload_word(r, 0))).as_bytes(),
            VType::StringWrapped => {
                let id = StringId::from_index(self.payload_word(r, 0));
                let offset = self.payload_word(r, 1) as usize;
                let length = self.payload_word(r, 2) as usize;
                &interns.get(id).as_bytes()[offset..offset + length]
            }
            VType::Substring => {
                let parent = self.payload_ref(r, 0);
                let offset = self.payload_word(r, 1) as usize;
                let length = self.payload_word(r, 2) as usize;
                &self.get_data(parent)[offset..offset + length]
            }
            other => panic!("string bytes of {other:?}"),
        }
    }

    /// Byte offset of `needle` in `text` from `start`, or null.
    #[must_use]
    pub fn string_index_of(&self, interns: &Interner, text: VRef, start: usize, needle: &[u8]) -> Option<usize> {
        let bytes = self.string_bytes(interns, text);
        if needle.is_empty() || start + needle.len() > bytes.len() {
            return None;
        }
        bytes[start..]
            .windows(needle.len())
            .position(|window| window == needle)
            .map(|pos| start + pos)
    }

    /// Splits a string on a delimiter into an array of substrings.
    ///
    /// With `trim_last`, a trailing empty piece (text ending in the
    /// delimiter) is dropped; with `remove_empty`, all empty pieces are.
    pub fn split(&mut self, interns: &Interner, text: VRef, delimiter: &[u8], remove_empty: bool, trim_last: bool) -> VRef {
        let length = self.string_length(interns, text);
        if length == 0 {
            return self.singles.empty_list;
        }
        if delimiter.is_empty() || length < delimiter.len() {
            let single = [text];
            return self.create_array(&single);
        }
        let mut pieces = Vec::new();
        let mut last = 0;
        loop {
            match self.string_index_of(interns, text, last, delimiter) {
                Some(pos) => {
                    if pos != last || !remove_empty {
                        pieces.push((last, pos - last));
                    }
                    last = pos + delimiter.len();
                }
                None => {
                    if length != last || !(remove_empty || trim_last) {
                        pieces.push((last, length - last));
                    }
                    break;
                }
            }
        }
        let refs: Vec<VRef> = pieces
            .into_iter()
            .map(|(offset, len)| self.create_substring(interns, text, offset, len))
            .collect();
        self.create_array(&refs)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Interns a path and wraps it in a File value.
    pub fn create_file(&mut self, path: &str) -> VRef {
        let id = self.files.add(path);
        self.create_file_from_id(id)
    }

    pub fn create_file_from_id(&mut self, id: FileId) -> VRef {
        let r = self.alloc(VType::File, 4);
        self.set_payload_word(r, 0, id.index());
        r
    }

    /// File id of a File value.
    ///
    /// # Panics
    /// Panics when the value is not a File.
    #[must_use]
    pub fn get_file(&self, r: VRef) -> FileId {
        assert_eq!(self.get_type(r), VType::File, "value is not a file");
        FileId::from_index(self.payload_word(r, 0))
    }

    /// Expands a glob pattern into an array of File values.
    pub fn create_fileset(&mut self, pattern: &str) -> VRef {
        let ids = self.files.glob(pattern);
        let refs: Vec<VRef> = ids.into_iter().map(|id| self.create_file_from_id(id)).collect();
        self.create_array(&refs)
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Copies refs into a fixed-size array value.
    pub fn create_array(&mut self, values: &[VRef]) -> VRef {
        if values.is_empty() {
            return self.singles.empty_list;
        }
        let r = self.alloc(VType::Array, values.len() * 4);
        for (i, &value) in values.iter().enumerate() {
            self.set_payload_word(r, i, value.to_bits());
        }
        r
    }

    /// Builds an inclusive ascending integer range.
    ///
    /// # Panics
    /// Panics when either bound is not an integer or `lo > hi`; the VM
    /// validates both before calling.
    pub fn create_range(&mut self, lo: VRef, hi: VRef) -> VRef {
        let low = Self::unbox_integer(lo);
        let high = Self::unbox_integer(hi);
        assert!(low <= high, "descending range");
        let r = self.alloc(VType::IntegerRange, 8);
        self.set_payload_word(r, 0, low as u32);
        self.set_payload_word(r, 1, high as u32);
        r
    }

    /// Lazy list concatenation. Empty operands collapse to the other side.
    pub fn concat(&mut self, list1: VRef, list2: VRef) -> VRef {
        debug_assert!(self.is_collection(list1) && self.is_collection(list2));
        if self.collection_size(list1) == 0 {
            return list2;
        }
        if self.collection_size(list2) == 0 {
            return list1;
        }
        let r = self.alloc(VType::ConcatList, 8);
        self.set_payload_word(r, 0, list1.to_bits());
        self.set_payload_word(r, 1, list2.to_bits());
        r
    }

    /// Renders both operands and joins them into a fresh string.
    pub fn concat_strings(&mut self, interns: &Interner, a: VRef, b: VRef) -> VRef {
        let total = self.string_length(interns, a) + self.string_length(interns, b);
        if total == 0 {
            return self.singles.empty_string;
        }
        let mut bytes = Vec::with_capacity(total);
        self.write_string(interns, a, &mut bytes);
        self.write_string(interns, b, &mut bytes);
        self.create_string(&bytes)
    }

    #[must_use]
    pub fn is_collection(&self, r: VRef) -> bool {
        self.get_type(r).is_collection()
    }

    #[must_use]
    pub fn is_string(&self, r: VRef) -> bool {
        self.get_type(r).is_string()
    }

    /// Number of elements, flattening concat nodes.
    #[must_use]
    pub fn collection_size(&self, r: VRef) -> usize {
        match self.get_type(r) {
            VType::EmptyList => 0,
            VType::Array => self.get_size(r) / 4,
            VType::IntegerRange => {
                let lo = self.payload_word(r, 0) as i32;
                let hi = self.payload_word(r, 1) as i32;
                (hi - lo) as usize + 1
            }
            VType::ConcatList => {
                let parts = self.get_size(r) / 4;
                (0..parts).map(|i| self.collection_size(self.payload_ref(r, i))).sum()
            }
            other => panic!("collection size of {other:?}"),
        }
    }

    /// Fetches the element at `index` in flattened order.
    #[must_use]
    pub fn collection_get(&self, r: VRef, index: usize) -> Option<VRef> {
        match self.get_type(r) {
            VType::EmptyList => None,
            VType::Array => {
                if index < self.get_size(r) / 4 {
                    Some(self.payload_ref(r, index))
                } else {
                    None
                }
            }
            VType::IntegerRange => {
                let lo = self.payload_word(r, 0) as i32;
                let hi = self.payload_word(r, 1) as i32;
                let index = i32::try_from(index).ok()?;
                if lo + index <= hi { Some(VRef::from_int(lo + index)) } else { None }
            }
            VType::ConcatList => {
                let parts = self.get_size(r) / 4;
                let mut remaining = index;
                for i in 0..parts {
                    let child = self.payload_ref(r, i);
                    let size = self.collection_size(child);
                    if remaining < size {
                        return self.collection_get(child, remaining);
                    }
                    remaining -= size;
                }
                None
            }
            other => panic!("indexed access of {other:?}"),
        }
    }

    /// Iterates a collection in flattened order.
    #[must_use]
    pub fn iterate(&self, r: VRef) -> CollectionIter<'_> {
        CollectionIter {
            heap: self,
            stack: vec![IterFrame { object: r, index: 0 }],
        }
    }

    // ------------------------------------------------------------------
    // Futures
    // ------------------------------------------------------------------

    /// Allocates a pending future.
    pub fn create_future(&mut self) -> VRef {
        self.alloc(VType::Future, 16)
    }

    /// Fulfils a pending future.
    ///
    /// # Panics
    /// A future is fulfilled exactly once; fulfilling a resolved or
    /// expression future is a programming error.
    pub fn set_future(&mut self, fut: VRef, value: VRef) {
        assert_eq!(self.get_type(fut), VType::Future, "not a future");
        assert_eq!(self.payload_word(fut, 0), FUTURE_PENDING, "future fulfilled twice");
        self.set_payload_word(fut, 0, FUTURE_RESOLVED);
        self.set_payload_word(fut, 2, value.to_bits());
    }

    fn future_unary(&mut self, op: UnaryOp, a: VRef) -> VRef {
        let r = self.create_future();
        self.set_payload_word(r, 0, FUTURE_UNARY);
        self.set_payload_word(r, 1, op as u32);
        self.set_payload_word(r, 2, a.to_bits());
        r
    }

    fn future_binary(&mut self, op: BinaryOp, a: VRef, b: VRef) -> VRef {
        let r = self.create_future();
        self.set_payload_word(r, 0, FUTURE_BINARY);
        self.set_payload_word(r, 1, op as u32);
        self.set_payload_word(r, 2, a.to_bits());
        self.set_payload_word(r, 3, b.to_bits());
        r
    }

    /// Resolves a value as far as currently possible.
    ///
    /// Returns the fulfilled value for resolved futures, evaluates
    /// expression futures whose operands have become concrete (caching
    /// the result in place), and returns the same reference when the
    /// value is still unknown. Non-futures come back unchanged.
    pub fn try_wait(&mut self, interns: &Interner, r: VRef) -> VRef {
        if self.get_type(r) != VType::Future {
            return r;
        }
        match self.payload_word(r, 0) {
            FUTURE_PENDING => r,
            FUTURE_RESOLVED => self.try_wait(interns, self.payload_ref(r, 2)),
            FUTURE_UNARY => {
                let op = UnaryOp::from_repr(self.payload_word(r, 1)).expect("corrupt future op");
                let a = self.try_wait(interns, self.payload_ref(r, 2));
                if self.is_future(a) {
                    return r;
                }
                match self.eval_unary(interns, op, a) {
                    Ok(value) => {
                        self.resolve_in_place(r, value);
                        value
                    }
                    Err(_) => r,
                }
            }
            FUTURE_BINARY => {
                let op = BinaryOp::from_repr(self.payload_word(r, 1)).expect("corrupt future op");
                let a = self.try_wait(interns, self.payload_ref(r, 2));
                let b = self.try_wait(interns, self.payload_ref(r, 3));
                // A conjunction with one side known false is false no
                // matter what the other side resolves to; path
                // conditions of dead strands rely on this.
                if op == BinaryOp::And
                    && (self.truth(interns, a) == Truth::False || self.truth(interns, b) == Truth::False)
                {
                    let false_ = self.singles.false_;
                    self.resolve_in_place(r, false_);
                    return false_;
                }
                if self.is_future(a) || self.is_future(b) {
                    return r;
                }
                match self.eval_binary(interns, op, a, b) {
                    Ok(value) => {
                        self.resolve_in_place(r, value);
                        value
                    }
                    Err(_) => r,
                }
            }
            other => panic!("corrupt future state {other}"),
        }
    }

    fn resolve_in_place(&mut self, fut: VRef, value: VRef) {
        self.set_payload_word(fut, 0, FUTURE_RESOLVED);
        self.set_payload_word(fut, 2, value.to_bits());
    }

    #[must_use]
    pub fn is_future(&self, r: VRef) -> bool {
        self.get_type(r) == VType::Future
    }

    // ------------------------------------------------------------------
    // Operator application
    // ------------------------------------------------------------------

    /// Applies a binary operation, lifting to an expression future when
    /// either operand is still unknown.
    pub fn apply_binary(&mut self, interns: &Interner, op: BinaryOp, a: VRef, b: VRef) -> EvalResult {
        let a = self.try_wait(interns, a);
        let b = self.try_wait(interns, b);
        if op == BinaryOp::And
            && (self.truth(interns, a) == Truth::False || self.truth(interns, b) == Truth::False)
        {
            return Ok(self.singles.false_);
        }
        if self.is_future(a) || self.is_future(b) {
            return Ok(self.future_binary(op, a, b));
        }
        self.eval_binary(interns, op, a, b)
    }

    /// Applies a unary operation, lifting to an expression future when
    /// the operand is still unknown.
    pub fn apply_unary(&mut self, interns: &Interner, op: UnaryOp, a: VRef) -> EvalResult {
        let a = self.try_wait(interns, a);
        if self.is_future(a) {
            return Ok(self.future_unary(op, a));
        }
        self.eval_unary(interns, op, a)
    }

    fn int_operands(&self, op: &str, a: VRef, b: VRef) -> Result<(i32, i32), EvalError> {
        match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(EvalError(format!("'{op}' requires integer operands"))),
        }
    }

    fn checked_int(value: Option<i32>, what: &str) -> EvalResult {
        match value {
            Some(v) if (INT_MIN..=INT_MAX).contains(&v) => Ok(VRef::from_int(v)),
            _ => Err(EvalError(format!("Integer overflow in '{what}'"))),
        }
    }

    fn eval_binary(&mut self, interns: &Interner, op: BinaryOp, a: VRef, b: VRef) -> EvalResult {
        match op {
            BinaryOp::Equals => Ok(self.boolean(self.equals(interns, a, b))),
            BinaryOp::NotEquals => Ok(self.boolean(!self.equals(interns, a, b))),
            BinaryOp::Less => {
                let (x, y) = self.int_operands("<", a, b)?;
                Ok(self.boolean(x < y))
            }
            BinaryOp::LessEquals => {
                let (x, y) = self.int_operands("<=", a, b)?;
                Ok(self.boolean(x <= y))
            }
            BinaryOp::Greater => {
                let (x, y) = self.int_operands(">", a, b)?;
                Ok(self.boolean(x > y))
            }
            BinaryOp::GreaterEquals => {
                let (x, y) = self.int_operands(">=", a, b)?;
                Ok(self.boolean(x >= y))
            }
            BinaryOp::And => {
                let both = self.truth(interns, a) == Truth::True && self.truth(interns, b) == Truth::True;
                Ok(self.boolean(both))
            }
            BinaryOp::Add => {
                let (x, y) = self.int_operands("+", a, b)?;
                Self::checked_int(x.checked_add(y), "+")
            }
            BinaryOp::Sub => {
                let (x, y) = self.int_operands("-", a, b)?;
                Self::checked_int(x.checked_sub(y), "-")
            }
            BinaryOp::Mul => {
                let (x, y) = self.int_operands("*", a, b)?;
                Self::checked_int(x.checked_mul(y), "*")
            }
            BinaryOp::Div => {
                let (x, y) = self.int_operands("/", a, b)?;
                if y == 0 {
                    return Err(EvalError("Division by zero".to_owned()));
                }
                Self::checked_int(x.checked_div(y), "/")
            }
            BinaryOp::Rem => {
                let (x, y) = self.int_operands("%", a, b)?;
                if y == 0 {
                    return Err(EvalError("Division by zero".to_owned()));
                }
                Self::checked_int(x.checked_rem(y), "%")
            }
            BinaryOp::ConcatList => {
                if !self.is_collection(a) || !self.is_collection(b) {
                    return Err(EvalError("'::' requires list operands".to_owned()));
                }
                Ok(self.concat(a, b))
            }
            BinaryOp::ConcatString => Ok(self.concat_strings(interns, a, b)),
            BinaryOp::IndexedAccess => {
                if !self.is_collection(a) {
                    return Err(EvalError("Indexing a non-list value".to_owned()));
                }
                let index = b
                    .as_int()
                    .and_then(|i| usize::try_from(i).ok())
                    .ok_or_else(|| EvalError("List index must be a non-negative integer".to_owned()))?;
                self.collection_get(a, index)
                    .ok_or_else(|| EvalError(format!("Index {index} out of range")))
            }
            BinaryOp::Range => {
                let (x, y) = self.int_operands("..", a, b)?;
                if x > y {
                    return Err(EvalError("Descending range".to_owned()));
                }
                Ok(self.create_range(a, b))
            }
        }
    }

    fn eval_unary(&mut self, interns: &Interner, op: UnaryOp, a: VRef) -> EvalResult {
        match op {
            UnaryOp::Not => match self.truth(interns, a) {
                Truth::True => Ok(self.singles.false_),
                Truth::False => Ok(self.singles.true_),
                Truth::Future => unreachable!("operand resolved before eval"),
            },
            UnaryOp::Neg => {
                let x = a.as_int().ok_or_else(|| EvalError("'-' requires an integer operand".to_owned()))?;
                Self::checked_int(x.checked_neg(), "-")
            }
            UnaryOp::Inv => {
                let x = a.as_int().ok_or_else(|| EvalError("'~' requires an integer operand".to_owned()))?;
                Ok(VRef::from_int(!x))
            }
        }
    }

    // ------------------------------------------------------------------
    // Equality, truthiness, hashing, rendering
    // ------------------------------------------------------------------

    /// Structural equality for strings and collections; identity for
    /// booleans and null; id equality for files. A collection never
    /// equals a non-collection.
    #[must_use]
    pub fn equals(&self, interns: &Interner, a: VRef, b: VRef) -> bool {
        if a == b {
            return true;
        }
        if a.is_null() || b.is_null() {
            return false;
        }
        match self.get_type(a) {
            VType::Null | VType::BooleanTrue | VType::BooleanFalse | VType::Integer | VType::Future => false,
            VType::String | VType::StringPooled | VType::StringWrapped | VType::Substring => {
                self.get_type(b).is_string() && self.string_bytes(interns, a) == self.string_bytes(interns, b)
            }
            VType::File => self.get_type(b) == VType::File && self.payload_word(a, 0) == self.payload_word(b, 0),
            VType::EmptyList | VType::Array | VType::IntegerRange | VType::ConcatList => {
                if !self.is_collection(b) || self.collection_size(a) != self.collection_size(b) {
                    return false;
                }
                self.iterate(a)
                    .zip(self.iterate(b))
                    .all(|(x, y)| self.equals(interns, x, y))
            }
        }
    }

    /// Three-valued truthiness; see [`Truth`].
    #[must_use]
    pub fn truth(&self, interns: &Interner, r: VRef) -> Truth {
        if r.is_null() {
            return Truth::False;
        }
        match self.get_type(r) {
            VType::BooleanTrue => Truth::True,
            VType::BooleanFalse => Truth::False,
            VType::Integer => {
                if Self::unbox_integer(r) == 0 {
                    Truth::False
                } else {
                    Truth::True
                }
            }
            VType::String | VType::StringPooled | VType::StringWrapped | VType::Substring => {
                if self.string_bytes(interns, r).is_empty() {
                    Truth::False
                } else {
                    Truth::True
                }
            }
            VType::EmptyList => Truth::False,
            VType::Array | VType::IntegerRange | VType::ConcatList => {
                if self.collection_size(r) == 0 {
                    Truth::False
                } else {
                    Truth::True
                }
            }
            VType::File | VType::Null => Truth::True,
            VType::Future => match self.payload_word(r, 0) {
                FUTURE_RESOLVED => self.truth(interns, self.payload_ref(r, 2)),
                _ => Truth::Future,
            },
        }
    }

    /// Streams one value into a digest: a stable tag byte, then payload.
    ///
    /// All string shapes hash as [`VType::String`] and all collection
    /// shapes as [`VType::Array`] followed by their flattened elements,
    /// so equal values hash equally regardless of construction.
    ///
    /// # Panics
    /// Panics on a pending future; resolve with [`Heap::try_wait`] first.
    pub fn hash_into(&self, interns: &Interner, state: &mut Sha512, r: VRef) {
        if r.is_null() {
            state.update([VType::Null as u8]);
            return;
        }
        match self.get_type(r) {
            VType::Null => state.update([VType::Null as u8]),
            VType::BooleanTrue => state.update([VType::BooleanTrue as u8]),
            VType::BooleanFalse => state.update([VType::BooleanFalse as u8]),
            VType::Integer => {
                state.update([VType::Integer as u8]);
                state.update(Self::unbox_integer(r).to_le_bytes());
            }
            VType::String | VType::StringPooled | VType::StringWrapped | VType::Substring => {
                state.update([VType::String as u8]);
                state.update(self.string_bytes(interns, r));
            }
            VType::File => {
                state.update([VType::File as u8]);
                state.update(self.files.name(self.get_file(r)).as_bytes());
            }
            VType::EmptyList | VType::Array | VType::IntegerRange | VType::ConcatList => {
                state.update([VType::Array as u8]);
                for element in self.iterate(r) {
                    self.hash_into(interns, state, element);
                }
            }
            VType::Future => {
                assert_eq!(self.payload_word(r, 0), FUTURE_RESOLVED, "hashing a pending future");
                self.hash_into(interns, state, self.payload_ref(r, 2));
            }
        }
    }

    /// Length in bytes of the default rendering of a value.
    ///
    /// Matches [`Heap::write_string`] exactly; a collection renders as
    /// `[a, b, c]`.
    #[must_use]
    pub fn string_length(&self, interns: &Interner, r: VRef) -> usize {
        if r.is_null() {
            return 4;
        }
        match self.get_type(r) {
            VType::Null => 4,
            VType::BooleanTrue => 4,
            VType::BooleanFalse => 5,
            VType::Integer => {
                let mut value = i64::from(Self::unbox_integer(r));
                let mut size = 1;
                if value < 0 {
                    size = 2;
                    value = -value;
                }
                while value > 9 {
                    value /= 10;
                    size += 1;
                }
                size
            }
            VType::String | VType::StringPooled | VType::StringWrapped | VType::Substring => {
                self.string_bytes(interns, r).len()
            }
            VType::File => self.files.name(self.get_file(r)).len(),
            VType::EmptyList | VType::Array | VType::IntegerRange | VType::ConcatList => {
                let count = self.collection_size(r);
                let separators = 2 + 2 * count.saturating_sub(1);
                separators + self.iterate(r).map(|e| self.string_length(interns, e)).sum::<usize>()
            }
            VType::Future => match self.payload_word(r, 0) {
                FUTURE_RESOLVED => self.string_length(interns, self.payload_ref(r, 2)),
                _ => panic!("rendering a pending future"),
            },
        }
    }

    /// Appends the default rendering of a value.
    pub fn write_string(&self, interns: &Interner, r: VRef, out: &mut Vec<u8>) {
        if r.is_null() {
            out.extend_from_slice(b"null");
            return;
        }
        match self.get_type(r) {
            VType::Null => out.extend_from_slice(b"null"),
            VType::BooleanTrue => out.extend_from_slice(b"true"),
            VType::BooleanFalse => out.extend_from_slice(b"false"),
            VType::Integer => {
                let mut buffer = itoa_buffer(Self::unbox_integer(r));
                out.append(&mut buffer);
            }
            VType::String | VType::StringPooled | VType::StringWrapped | VType::Substring => {
                out.extend_from_slice(self.string_bytes(interns, r));
            }
            VType::File => out.extend_from_slice(self.files.name(self.get_file(r)).as_bytes()),
            VType::EmptyList | VType::Array | VType::IntegerRange | VType::ConcatList => {
                out.push(b'[');
                for (i, element) in self.iterate(r).enumerate() {
                    if i > 0 {
                        out.extend_from_slice(b", ");
                    }
                    self.write_string(interns, element, out);
                }
                out.push(b']');
            }
            VType::Future => match self.payload_word(r, 0) {
                FUTURE_RESOLVED => self.write_string(interns, self.payload_ref(r, 2), out),
                _ => panic!("rendering a pending future"),
            },
        }
    }

    /// Convenience wrapper collecting [`Heap::write_string`] output.
    #[must_use]
    pub fn render(&self, interns: &Interner, r: VRef) -> String {
        let mut out = Vec::new();
        self.write_string(interns, r, &mut out);
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Signed decimal formatting without going through `fmt`.
fn itoa_buffer(value: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    let mut v = i64::from(value);
    if v < 0 {
        out.push(b'-');
        v = -v;
    }
    let start = out.len();
    loop {
        out.insert(start, b'0' + (v % 10) as u8);
        v /= 10;
        if v == 0 {
            break;
        }
    }
    out
}

struct IterFrame {
    object: VRef,
    index: usize,
}

/// Depth-first flattening iterator over a collection.
pub struct CollectionIter<'h> {
    heap: &'h Heap,
    stack: Vec<IterFrame>,
}

impl Iterator for CollectionIter<'_> {
    type Item = VRef;

    fn next(&mut self) -> Option<VRef> {
        loop {
            let frame = self.stack.last_mut()?;
            let object = frame.object;
            let index = frame.index;
            match self.heap.get_type(object) {
                VType::EmptyList => {
                    self.stack.pop();
                }
                VType::Array | VType::IntegerRange => {
                    if let Some(value) = self.heap.collection_get(object, index) {
                        frame.index += 1;
                        return Some(value);
                    }
                    self.stack.pop();
                }
                VType::ConcatList => {
                    let parts = self.heap.get_size(object) / 4;
                    if index < parts {
                        frame.index += 1;
                        let child = self.heap.payload_ref(object, index);
                        self.stack.push(IterFrame { object: child, index: 0 });
                    } else {
                        self.stack.pop();
                    }
                }
                other => panic!("iterating {other:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn setup() -> (Heap, Interner) {
        (Heap::new(), Interner::new())
    }

    fn rendered(heap: &Heap, interns: &Interner, r: VRef) -> String {
        heap.render(interns, r)
    }

    #[test]
    fn singletons_render() {
        let (heap, interns) = setup();
        assert_eq!(rendered(&heap, &interns, heap.singles().true_), "true");
        assert_eq!(rendered(&heap, &interns, heap.singles().false_), "false");
        assert_eq!(rendered(&heap, &interns, VRef::NULL), "null");
        assert_eq!(rendered(&heap, &interns, heap.singles().empty_list), "[]");
    }

    #[test]
    fn string_length_matches_write_string() {
        let (mut heap, mut interns) = setup();
        let pooled_id = interns.add("pooled text");
        let values = vec![
            VRef::NULL,
            heap.singles().true_,
            heap.singles().false_,
            VRef::from_int(0),
            VRef::from_int(-1),
            VRef::from_int(123_456),
            VRef::from_int(INT_MIN),
            heap.create_string(b"hello"),
            heap.create_pooled_string(pooled_id),
            heap.singles().empty_string,
            heap.create_file("src/main.c"),
        ];
        let list = heap.create_array(&values[3..7]);
        let range = {
            let lo = VRef::from_int(1);
            let hi = VRef::from_int(4);
            heap.create_range(lo, hi)
        };
        let nested = heap.concat(list, range);
        for value in values.into_iter().chain([list, range, nested]) {
            let mut out = Vec::new();
            heap.write_string(&interns, value, &mut out);
            assert_eq!(heap.string_length(&interns, value), out.len(), "value {value:?}");
        }
    }

    #[test]
    fn substring_never_copies_and_views_bytes() {
        let (mut heap, mut interns) = setup();
        let base = heap.create_string(b"hello world");
        let sub = heap.create_substring(&interns, base, 6, 5);
        assert_eq!(heap.string_bytes(&interns, sub), b"world");

        // A substring of a substring flattens to the base string.
        let sub2 = heap.create_substring(&interns, sub, 1, 3);
        assert_eq!(heap.string_bytes(&interns, sub2), b"orl");

        // Full-length substrings return the parent unchanged.
        assert_eq!(heap.create_substring(&interns, base, 0, 11), base);

        // Pooled parents produce wrapped views.
        let id = interns.add("abcdef");
        let pooled = heap.create_pooled_string(id);
        let wrapped = heap.create_substring(&interns, pooled, 2, 3);
        assert_eq!(heap.get_type(wrapped), VType::StringWrapped);
        assert_eq!(heap.string_bytes(&interns, wrapped), b"cde");
    }

    #[test]
    fn equality_rules() {
        let (mut heap, interns) = setup();
        let a = heap.create_string(b"same");
        let b = heap.create_string(b"same");
        let c = heap.create_string(b"other");
        assert!(heap.equals(&interns, a, b));
        assert!(heap.equals(&interns, b, a));
        assert!(!heap.equals(&interns, a, c));

        let list_a = heap.create_array(&[VRef::from_int(1), VRef::from_int(2)]);
        let lo = VRef::from_int(1);
        let hi = VRef::from_int(2);
        let range = heap.create_range(lo, hi);
        assert!(heap.equals(&interns, list_a, range));

        // A collection never equals a non-collection.
        assert!(!heap.equals(&interns, list_a, a));
        assert!(!heap.equals(&interns, a, list_a));

        assert!(heap.equals(&interns, VRef::NULL, VRef::NULL));
        assert!(!heap.equals(&interns, VRef::NULL, heap.singles().false_));
    }

    #[test]
    fn concat_preserves_order_and_size() {
        let (mut heap, interns) = setup();
        let a = heap.create_array(&[VRef::from_int(1), VRef::from_int(2)]);
        let b = heap.create_array(&[VRef::from_int(3)]);
        let c = heap.concat(a, b);
        assert_eq!(heap.collection_size(c), 3);
        let values: Vec<i32> = heap.iterate(c).map(Heap::unbox_integer).collect();
        assert_eq!(values, vec![1, 2, 3]);

        // Empty operands collapse.
        let empty = heap.singles().empty_list;
        assert_eq!(heap.concat(empty, a), a);
        assert_eq!(heap.concat(a, empty), a);

        let _ = interns;
    }

    #[test]
    fn indexed_access_through_concat() {
        let (mut heap, _interns) = setup();
        let a = heap.create_array(&[VRef::from_int(10)]);
        let lo = VRef::from_int(20);
        let hi = VRef::from_int(22);
        let range = heap.create_range(lo, hi);
        let c = heap.concat(a, range);
        assert_eq!(heap.collection_get(c, 0), Some(VRef::from_int(10)));
        assert_eq!(heap.collection_get(c, 2), Some(VRef::from_int(21)));
        assert_eq!(heap.collection_get(c, 4), None);
    }

    #[test]
    fn truthiness() {
        let (mut heap, mut interns) = setup();
        let empty_pool = interns.add("");
        let falsy = vec![
            VRef::NULL,
            heap.singles().false_,
            VRef::from_int(0),
            heap.singles().empty_string,
            heap.singles().empty_list,
            heap.create_pooled_string(empty_pool),
        ];
        for value in falsy {
            assert_eq!(heap.truth(&interns, value), Truth::False, "{value:?}");
        }
        let truthy = vec![
            heap.singles().true_,
            VRef::from_int(-1),
            heap.create_string(b"x"),
            heap.create_array(&[VRef::from_int(0)]),
            heap.create_file("a"),
        ];
        for value in truthy {
            assert_eq!(heap.truth(&interns, value), Truth::True, "{value:?}");
        }
    }

    #[test]
    fn futures_fulfil_once() {
        let (mut heap, interns) = setup();
        let fut = heap.create_future();
        assert_eq!(heap.try_wait(&interns, fut), fut);
        assert_eq!(heap.truth(&interns, fut), Truth::Future);
        heap.set_future(fut, VRef::from_int(7));
        assert_eq!(heap.try_wait(&interns, fut), VRef::from_int(7));
        assert_eq!(heap.truth(&interns, fut), Truth::True);
    }

    #[test]
    #[should_panic(expected = "fulfilled twice")]
    fn double_fulfil_panics() {
        let (mut heap, _interns) = setup();
        let fut = heap.create_future();
        heap.set_future(fut, VRef::from_int(1));
        heap.set_future(fut, VRef::from_int(2));
    }

    #[test]
    fn expression_futures_resolve_lazily() {
        let (mut heap, interns) = setup();
        let fut = heap.create_future();
        let sum = heap.apply_binary(&interns, BinaryOp::Add, fut, VRef::from_int(2)).unwrap();
        assert!(heap.is_future(sum));
        let cond = heap
            .apply_binary(&interns, BinaryOp::Equals, sum, VRef::from_int(5))
            .unwrap();
        assert!(heap.is_future(cond));
        assert_eq!(heap.try_wait(&interns, cond), cond);

        heap.set_future(fut, VRef::from_int(3));
        assert_eq!(heap.try_wait(&interns, sum), VRef::from_int(5));
        let resolved = heap.try_wait(&interns, cond);
        assert_eq!(resolved, heap.singles().true_);
    }

    #[test]
    fn condition_algebra_over_futures() {
        let (mut heap, interns) = setup();
        let pred = heap.create_future();
        let not_pred = heap.apply_unary(&interns, UnaryOp::Not, pred).unwrap();
        let both = heap
            .apply_binary(&interns, BinaryOp::And, heap.singles().true_, not_pred)
            .unwrap();
        assert!(heap.is_future(both));
        heap.set_future(pred, heap.singles().false_);
        assert_eq!(heap.try_wait(&interns, both), heap.singles().true_);
    }

    #[test]
    fn arithmetic_errors() {
        let (mut heap, interns) = setup();
        let s = heap.create_string(b"text");
        assert!(heap.apply_binary(&interns, BinaryOp::Add, s, VRef::from_int(1)).is_err());
        assert!(
            heap.apply_binary(&interns, BinaryOp::Div, VRef::from_int(1), VRef::from_int(0))
                .is_err()
        );
        assert!(
            heap.apply_binary(&interns, BinaryOp::Mul, VRef::from_int(INT_MAX), VRef::from_int(2))
                .is_err()
        );
    }

    #[test]
    fn string_concat_renders_operands() {
        let (mut heap, interns) = setup();
        let s = heap.create_string(b"count: ");
        let joined = heap
            .apply_binary(&interns, BinaryOp::ConcatString, s, VRef::from_int(3))
            .unwrap();
        assert_eq!(heap.render(&interns, joined), "count: 3");
    }

    #[test]
    fn hash_is_shape_independent() {
        let (mut heap, interns) = setup();
        let list = heap.create_array(&[VRef::from_int(1), VRef::from_int(2), VRef::from_int(3)]);
        let lo = VRef::from_int(1);
        let hi = VRef::from_int(3);
        let range = heap.create_range(lo, hi);
        let split_a = heap.create_array(&[VRef::from_int(1)]);
        let split_b = heap.create_array(&[VRef::from_int(2), VRef::from_int(3)]);
        let concat = heap.concat(split_a, split_b);
        let other = heap.create_array(&[VRef::from_int(1), VRef::from_int(2)]);

        let digest = |r: VRef| {
            let mut state = Sha512::new();
            heap.hash_into(&interns, &mut state, r);
            state.finalize()
        };
        assert_eq!(digest(list), digest(range));
        assert_eq!(digest(list), digest(concat));
        assert_ne!(digest(list), digest(other));
    }

    #[test]
    fn split_lines() {
        let (mut heap, interns) = setup();
        let text = heap.create_string(b"one\ntwo\n\nthree\n");
        let lines = heap.split(&interns, text, b"\n", false, true);
        let parts: Vec<String> = heap.iterate(lines).map(|r| heap.render(&interns, r)).collect();
        assert_eq!(parts, vec!["one", "two", "", "three"]);
    }

    #[test]
    fn split_remove_empty() {
        let (mut heap, interns) = setup();
        let text = heap.create_string(b"a::b::::c");
        let parts = heap.split(&interns, text, b"::", true, false);
        let rendered: Vec<String> = heap.iterate(parts).map(|r| heap.render(&interns, r)).collect();
        assert_eq!(rendered, vec!["a", "b", "c"]);
    }
}
