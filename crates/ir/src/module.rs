use cranelift_entity::{entity_impl, packed_option::PackedOption, PrimaryMap};
use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::Function;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncRef(u32);
entity_impl!(FuncRef);

/// A compiled contract module.
///
/// `main` is the runtime entry point and is always present; `create` is
/// the optional constructor. User-defined functions are reachable from
/// either through call terminators.
pub struct Module {
    pub funcs: PrimaryMap<FuncRef, Function>,
    /// User-defined functions by name, in declaration order.
    pub declared: IndexMap<SmolStr, FuncRef>,
    pub main: PackedOption<FuncRef>,
    pub create: PackedOption<FuncRef>,
}

impl Module {
    pub fn new() -> Self {
        Self {
            funcs: PrimaryMap::default(),
            declared: IndexMap::default(),
            main: None.into(),
            create: None.into(),
        }
    }

    pub fn main(&self) -> FuncRef {
        self.main.expand().expect("module has no main function")
    }

    pub fn create(&self) -> Option<FuncRef> {
        self.create.expand()
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncRef> {
        self.declared.get(name).copied()
    }

    pub fn iter_functions(&self) -> impl Iterator<Item = FuncRef> {
        self.funcs.keys()
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
