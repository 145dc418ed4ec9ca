//! String interning.
//!
//! The interner stores each unique string once and hands out stable
//! [`StringId`]s. Ids start at 1 so a raw id can double as a positive
//! instruction word during parsing; 0 is reserved to mean "no string".

use ahash::AHashMap;

/// Index into the interner's storage.
///
/// Uses `u32` to keep pre-link instruction words compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringId(u32);

impl StringId {
    /// Reconstructs an id from a raw instruction word.
    ///
    /// The caller is responsible for the word having come from
    /// [`StringId::index`] of the same interner.
    #[inline]
    #[must_use]
    pub fn from_index(index: u32) -> Self {
        debug_assert!(index > 0, "0 is not a valid string id");
        Self(index)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Append-only string pool.
#[derive(Debug, Default)]
pub struct Interner {
    strings: Vec<Box<str>>,
    lookup: AHashMap<Box<str>, StringId>,
}

impl Interner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning the existing id when already present.
    pub fn add(&mut self, value: &str) -> StringId {
        if let Some(&id) = self.lookup.get(value) {
            return id;
        }
        let boxed: Box<str> = value.into();
        self.strings.push(boxed.clone());
        let id = StringId(u32::try_from(self.strings.len()).expect("interner overflow"));
        self.lookup.insert(boxed, id);
        id
    }

    /// Looks up a string without interning it.
    #[must_use]
    pub fn find(&self, value: &str) -> Option<StringId> {
        self.lookup.get(value).copied()
    }

    /// Returns the string for an id.
    ///
    /// # Panics
    /// Panics if the id did not come from this interner.
    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.0 as usize - 1]
    }

    /// Number of interned strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn interning_deduplicates() {
        let mut interner = Interner::new();
        let a = interner.add("echo");
        let b = interner.add("exec");
        let a2 = interner.add("echo");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(interner.get(a), "echo");
        assert_eq!(interner.get(b), "exec");
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn ids_start_at_one() {
        let mut interner = Interner::new();
        let id = interner.add("first");
        assert_eq!(id.index(), 1);
    }
}
