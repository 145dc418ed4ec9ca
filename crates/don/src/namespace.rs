//! The script's namespace: names resolved to fields, functions, and
//! targets, plus the parameter metadata the linker binds against.

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::intern::StringId;

/// Index into the function table. Id 0 is the synthetic init function
/// that evaluates global field initialisers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(u32);

impl FunctionId {
    pub const INIT: Self = Self(0);

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into the field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId(u32);

impl FieldId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A declared parameter.
#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub name: StringId,
    /// Constant-reference word for the default, or `None` when the
    /// argument is required.
    pub default: Option<i32>,
}

/// Everything known about a declared function.
#[derive(Debug)]
pub struct FunctionInfo {
    pub name: StringId,
    /// Line of the declaration header.
    pub line: u32,
    /// Source byte offset just past the declaration line, where the body
    /// begins.
    pub body_offset: usize,
    pub params: Vec<Param>,
    /// Position of the single vararg parameter, if any.
    pub vararg: Option<usize>,
}

/// A declared global field and where its initialiser expression starts.
#[derive(Debug)]
pub struct FieldInfo {
    pub name: StringId,
    pub line: u32,
    pub expr_offset: usize,
}

/// Name tables for one script file.
///
/// Functions and fields keep declaration order (it is the linker's id
/// order and the disassembler's listing order); lookup goes through
/// hashed side tables.
#[derive(Debug, Default)]
pub struct Namespace {
    functions: IndexMap<StringId, FunctionInfo>,
    fields: IndexMap<StringId, FieldInfo>,
    function_ids: AHashMap<StringId, FunctionId>,
    field_ids: AHashMap<StringId, FieldId>,
}

impl Namespace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function. Returns `None` when the name is taken.
    pub fn add_function(&mut self, info: FunctionInfo) -> Option<FunctionId> {
        let name = info.name;
        if self.functions.contains_key(&name) {
            return None;
        }
        // Script functions start at id 1; 0 is the init function.
        let id = FunctionId(u32::try_from(self.functions.len() + 1).expect("function table overflow"));
        self.functions.insert(name, info);
        self.function_ids.insert(name, id);
        Some(id)
    }

    /// Registers a field. Returns `None` when the name is taken.
    pub fn add_field(&mut self, info: FieldInfo) -> Option<FieldId> {
        let name = info.name;
        if self.fields.contains_key(&name) {
            return None;
        }
        let id = FieldId(u32::try_from(self.fields.len()).expect("field table overflow"));
        self.fields.insert(name, info);
        self.field_ids.insert(name, id);
        Some(id)
    }

    #[must_use]
    pub fn get_function(&self, name: StringId) -> Option<FunctionId> {
        self.function_ids.get(&name).copied()
    }

    /// Every declared function is reachable from the command line.
    #[must_use]
    pub fn get_target(&self, name: StringId) -> Option<FunctionId> {
        self.get_function(name)
    }

    #[must_use]
    pub fn get_field(&self, name: StringId) -> Option<FieldId> {
        self.field_ids.get(&name).copied()
    }

    /// Function metadata by id.
    ///
    /// # Panics
    /// Panics for [`FunctionId::INIT`]; the init function has no entry.
    #[must_use]
    pub fn function(&self, id: FunctionId) -> &FunctionInfo {
        assert!(id.0 > 0, "the init function has no metadata");
        &self.functions[id.0 as usize - 1]
    }

    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &FunctionInfo)> {
        self.functions
            .values()
            .enumerate()
            .map(|(i, info)| (FunctionId(u32::try_from(i + 1).expect("function table overflow")), info))
    }

    pub fn fields(&self) -> impl Iterator<Item = (FieldId, &FieldInfo)> {
        self.fields
            .values()
            .enumerate()
            .map(|(i, info)| (FieldId(u32::try_from(i).expect("field table overflow")), info))
    }

    #[must_use]
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::intern::Interner;

    fn info(name: StringId) -> FunctionInfo {
        FunctionInfo {
            name,
            line: 1,
            body_offset: 0,
            params: vec![],
            vararg: None,
        }
    }

    #[test]
    fn function_ids_follow_declaration_order() {
        let mut interns = Interner::new();
        let mut ns = Namespace::new();
        let a = interns.add("compile");
        let b = interns.add("test");
        let id_a = ns.add_function(info(a)).unwrap();
        let id_b = ns.add_function(info(b)).unwrap();
        assert_eq!(id_a.index(), 1);
        assert_eq!(id_b.index(), 2);
        assert_eq!(ns.get_function(a), Some(id_a));
        assert_eq!(ns.get_target(b), Some(id_b));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut interns = Interner::new();
        let mut ns = Namespace::new();
        let name = interns.add("default");
        assert!(ns.add_function(info(name)).is_some());
        assert!(ns.add_function(info(name)).is_none());
    }

    #[test]
    fn fields_resolve_by_name() {
        let mut interns = Interner::new();
        let mut ns = Namespace::new();
        let cc = interns.add("cc");
        let id = ns
            .add_field(FieldInfo {
                name: cc,
                line: 1,
                expr_offset: 5,
            })
            .unwrap();
        assert_eq!(ns.get_field(cc), Some(id));
        assert_eq!(id.index(), 0);
        assert_eq!(ns.get_function(cc), None);
    }
}
