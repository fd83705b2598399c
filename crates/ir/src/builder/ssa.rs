//! Lazy SSA value resolution.
//!
//! Variables are matched across blocks by their source name and declaring
//! scope, not by temporary identity. Each block caches the current
//! temporary per variable; a read that misses the cache walks the
//! predecessor graph and inserts a phi at the first merge point where the
//! predecessors disagree. Potential cycles through loop back edges are
//! broken by binding an operandless phi before recursing.
use cranelift_entity::SecondaryMap;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::{
    function::{BlockId, Function, SsaMeta},
    inst::Phi,
    types::Type,
    value::{Value, ValueId},
};

/// A variable identity: source name plus declaring lexical scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(super) struct VarKey {
    pub name: SmolStr,
    pub scope: u32,
}

struct Scope {
    id: u32,
    vars: IndexMap<SmolStr, Type>,
}

pub(super) struct SsaBuilder {
    scopes: Vec<Scope>,
    next_scope: u32,
    versions: FxHashMap<VarKey, u32>,
    block_defs: SecondaryMap<BlockId, FxHashMap<VarKey, ValueId>>,
}

impl SsaBuilder {
    pub(super) fn new() -> Self {
        Self {
            scopes: Vec::new(),
            next_scope: 0,
            versions: FxHashMap::default(),
            block_defs: SecondaryMap::default(),
        }
    }

    pub(super) fn push_scope(&mut self) {
        let id = self.next_scope;
        self.next_scope += 1;
        self.scopes.push(Scope {
            id,
            vars: IndexMap::default(),
        });
    }

    pub(super) fn pop_scope(&mut self) {
        self.scopes.pop().expect("scope stack underflow");
    }

    /// Declare `name` in the innermost scope, shadowing any outer binding.
    pub(super) fn declare(&mut self, name: &SmolStr, ty: Type) -> VarKey {
        let scope = self.scopes.last_mut().expect("no open scope");
        scope.vars.insert(name.clone(), ty);
        VarKey {
            name: name.clone(),
            scope: scope.id,
        }
    }

    /// Resolve `name` to its innermost visible declaration.
    pub(super) fn lookup(&self, name: &str) -> Option<(VarKey, Type)> {
        for scope in self.scopes.iter().rev() {
            if let Some(ty) = scope.vars.get(name) {
                return Some((
                    VarKey {
                        name: name.into(),
                        scope: scope.id,
                    },
                    *ty,
                ));
            }
        }
        None
    }

    /// Every visible variable, outermost first, shadowed names resolved to
    /// their innermost declaration.
    pub(super) fn visible_vars(&self) -> Vec<(VarKey, Type)> {
        let mut seen: IndexMap<SmolStr, (VarKey, Type)> = IndexMap::default();
        for scope in &self.scopes {
            for (name, ty) in &scope.vars {
                let key = VarKey {
                    name: name.clone(),
                    scope: scope.id,
                };
                seen.insert(name.clone(), (key, *ty));
            }
        }
        seen.into_values().collect()
    }

    /// Bind `value` as the current definition of `key` in `block`.
    pub(super) fn def_var(
        &mut self,
        func: &mut Function,
        key: &VarKey,
        ty: Type,
        block: BlockId,
        value: ValueId,
    ) {
        let version = self.bump_version(key);
        if func.ssa_meta[value].is_none() {
            func.ssa_meta[value] = Some(SsaMeta {
                var: key.name.clone(),
                version,
                scope: key.scope,
                ty,
            });
        }
        self.block_defs[block].insert(key.clone(), value);
    }

    /// The current value of `key` as observed from the end of `block`.
    ///
    /// Inserts a phi at `block` when its predecessors disagree, and caches
    /// the result so later reads in the same block observe the merge.
    pub(super) fn use_var(
        &mut self,
        func: &mut Function,
        key: &VarKey,
        ty: Type,
        block: BlockId,
    ) -> ValueId {
        if let Some(value) = self.block_defs[block].get(key) {
            return *value;
        }

        let preds: SmallVec<[BlockId; 4]> = func.blocks[block].preds.iter().copied().collect();
        let value = match preds.as_slice() {
            [] => panic!(
                "variable `{}` is undefined or used in an unreachable block",
                key.name
            ),
            [pred] => {
                let pred = *pred;
                self.use_var(func, key, ty, pred)
            }
            _ => return self.use_var_merge(func, key, ty, block, preds),
        };
        self.block_defs[block].insert(key.clone(), value);
        value
    }

    fn use_var_merge(
        &mut self,
        func: &mut Function,
        key: &VarKey,
        ty: Type,
        block: BlockId,
        preds: SmallVec<[BlockId; 4]>,
    ) -> ValueId {
        // Bind an operandless phi first to break cycles through back edges.
        let dest = self.make_phi(func, key, ty, block);

        let mut incoming: SmallVec<[(BlockId, ValueId); 2]> = SmallVec::new();
        for pred in preds {
            let value = self.use_var(func, key, ty, pred);
            incoming.push((pred, value));
        }

        let first = incoming[0].1;
        if first != dest && incoming.iter().all(|(_, v)| *v == first) {
            // The predecessors agree after all; drop the placeholder phi
            // (nothing can reference it yet) and resolve directly.
            let data = &mut func.blocks[block];
            let pos = data
                .phis
                .iter()
                .position(|phi| phi.result == dest)
                .unwrap();
            data.phis.remove(pos);
            self.block_defs[block].insert(key.clone(), first);
            return first;
        }

        let data = &mut func.blocks[block];
        let phi = data
            .phis
            .iter_mut()
            .find(|phi| phi.result == dest)
            .unwrap();
        phi.args = incoming;
        dest
    }

    /// Insert an empty phi for `key` at the top of `block` and bind it.
    pub(super) fn make_phi(
        &mut self,
        func: &mut Function,
        key: &VarKey,
        ty: Type,
        block: BlockId,
    ) -> ValueId {
        let dest = func.dfg.make_value(Value::Phi { block, ty });
        func.blocks[block].phis.push(Phi::new(dest, ty));
        self.def_var(func, key, ty, block, dest);
        dest
    }

    fn bump_version(&mut self, key: &VarKey) -> u32 {
        let version = self.versions.entry(key.clone()).or_insert(0);
        let current = *version;
        *version += 1;
        current
    }
}
